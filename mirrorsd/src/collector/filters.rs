//! The eligibility filters: guild exclusions are checked inline in the
//! collector; this module owns the DM spam / friend-request heuristics and
//! the automated-repost check, which are pure string logic.

/// Spam indicators for DMs from strangers. Two or more hits reject.
const SPAM_KEYWORDS: &[&str] = &[
    "free", "money", "profit", "trading", "investment", "crypto", "bitcoin",
    "earn", "daily", "guaranteed", "risk-free", "expert", "forex", "stocks",
    "options", "mutual server", "click", "link", "http", "www", ".com",
    "discord.gg", "join", "server", "community", "telegram", "@everyone",
    "nitro", "gift", "giveaway", "winner", "congratulations", "claim",
    "verify", "account", "suspended", "banned", "appeal", "support",
    "official", "staff", "admin", "moderator", "team discord",
];

/// Bots allowed to DM through the mirror, matched as substrings of the
/// display name.
const ALLOWED_DM_BOTS: &[&str] = &[
    "zebra check", "divine monitor", "divine", "hidden clearance bot",
    "monitor", "ticket tool", "notification", "alert", "checker", "1tap",
    "sneaker", "cook",
];

const MAX_SPAM_KEYWORDS: usize = 2;
const MAX_LINKS: usize = 1;
const MAX_EMOJI: usize = 10;
const MAX_DM_LENGTH: usize = 500;

/// Bot messages of the "posted by ... " + attachment shape are automated
/// reposts and never mirrored.
pub fn is_automated_repost(author_is_bot: bool, content: &str, attachment_count: usize) -> bool {
    author_is_bot && attachment_count > 0 && content.to_lowercase().contains("posted by")
}

/// Whether a DM looks like spam: keyword pileup, link pileup, emoji pileup,
/// or sheer length.
pub fn is_spam_dm(content: &str) -> bool {
    let content = content.to_lowercase();

    let keyword_hits = SPAM_KEYWORDS.iter().filter(|k| content.contains(*k)).count();
    if keyword_hits >= MAX_SPAM_KEYWORDS {
        return true;
    }

    if content.matches("http").count() > MAX_LINKS || content.matches(".com").count() > MAX_LINKS {
        return true;
    }

    let emoji_count = content.chars().filter(|c| !c.is_ascii()).count();
    if emoji_count > MAX_EMOJI {
        return true;
    }

    content.chars().count() > MAX_DM_LENGTH
}

/// Whether a DM from a non-bot peer passes. `mutual_guilds` is how many
/// guilds the collector shares with the peer, `shares_monitored_guild`
/// whether any of them is monitored.
pub fn should_allow_dm(content: &str, mutual_guilds: usize, shares_monitored_guild: bool) -> bool {
    // peers seen in a monitored guild are always allowed through
    if shares_monitored_guild {
        return true;
    }
    if is_spam_dm(content) {
        return false;
    }
    // no mutual servers, or almost none: friend-request noise
    mutual_guilds >= 2
}

/// Whether a bot peer is on the DM allow-list.
pub fn is_allowed_bot(display_name: &str) -> bool {
    let name = display_name.to_lowercase();
    ALLOWED_DM_BOTS.iter().any(|allowed| name.contains(allowed))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repost_requires_all_three_signals() {
        assert!(is_automated_repost(true, "Posted by @deals", 1));
        assert!(!is_automated_repost(false, "posted by @deals", 1));
        assert!(!is_automated_repost(true, "posted by @deals", 0));
        assert!(!is_automated_repost(true, "fresh restock", 3));
    }

    #[test]
    fn two_keywords_is_spam() {
        assert!(is_spam_dm("free nitro for you"));
        assert!(!is_spam_dm("are you coming to the meetup"));
    }

    #[test]
    fn link_pileup_is_spam() {
        assert!(is_spam_dm("http://a.io and also http://b.io"));
    }

    #[test]
    fn emoji_pileup_is_spam() {
        assert!(is_spam_dm("🎉🎉🎉🎉🎉🎉🎉🎉🎉🎉🎉"));
    }

    #[test]
    fn long_messages_are_spam() {
        assert!(is_spam_dm(&"a".repeat(501)));
        assert!(!is_spam_dm(&"a".repeat(500)));
    }

    #[test]
    fn monitored_guild_peer_bypasses_filters() {
        assert!(should_allow_dm("free nitro discord.gg/xyz", 1, true));
    }

    #[test]
    fn stranger_with_one_mutual_guild_is_rejected() {
        assert!(!should_allow_dm("hey", 1, false));
        assert!(should_allow_dm("hey", 2, false));
    }

    #[test]
    fn allowed_bots_match_by_substring() {
        assert!(is_allowed_bot("Zebra Check #4"));
        assert!(is_allowed_bot("1Tap Helper"));
        assert!(!is_allowed_bot("RandomSpamBot"));
    }
}
