//! Parsing of bot mentions in merge request comments.

use std::fmt;

/// A parsed bot command from a comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotCommand {
    /// Ask the queue to enqueue this merge request.
    Merge,
    /// The bot was addressed but the subcommand was not recognised; the
    /// front-end answers with usage text.
    Help,
}

impl fmt::Display for BotCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BotCommand::Merge => write!(f, "merge"),
            BotCommand::Help => write!(f, "help"),
        }
    }
}

/// Usage text posted in reply to an unrecognised command.
pub fn usage(bot_name: &str) -> String {
    format!(
        "Commands:\n\n* `@{} merge` - add this merge request to the merge queue",
        bot_name
    )
}

/// Find a bot command in a comment body.
///
/// The mention must start a line (comments often quote other comments;
/// quoted mentions are indented or prefixed and are ignored). Only the first
/// mention is honoured.
pub fn parse_command(body: &str, bot_name: &str) -> Option<BotCommand> {
    let mention = format!("@{}", bot_name);
    for line in body.lines() {
        let line = line.trim_end();
        let Some(rest) = line.strip_prefix(&mention) else {
            continue;
        };
        // Require a word boundary so @botname-other is not a mention.
        if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
            continue;
        }
        return match rest.split_whitespace().next() {
            Some("merge") => Some(BotCommand::Merge),
            _ => Some(BotCommand::Help),
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_merge_command() {
        assert_eq!(parse_command("@queue-bot merge", "queue-bot"), Some(BotCommand::Merge));
    }

    #[test]
    fn tolerates_trailing_text_on_other_lines() {
        let body = "Looks good to me!\n@queue-bot merge\nThanks";
        assert_eq!(parse_command(body, "queue-bot"), Some(BotCommand::Merge));
    }

    #[test]
    fn unknown_subcommand_yields_help() {
        assert_eq!(parse_command("@queue-bot dance", "queue-bot"), Some(BotCommand::Help));
        assert_eq!(parse_command("@queue-bot", "queue-bot"), Some(BotCommand::Help));
    }

    #[test]
    fn ignores_comments_without_a_mention() {
        assert_eq!(parse_command("just chatting about @queue-bot merge", "queue-bot"), None);
        assert_eq!(parse_command("", "queue-bot"), None);
    }

    #[test]
    fn ignores_longer_names_sharing_the_prefix() {
        assert_eq!(parse_command("@queue-bot-2 merge", "queue-bot"), None);
    }

    #[test]
    fn extra_whitespace_is_accepted() {
        assert_eq!(parse_command("@queue-bot   merge  ", "queue-bot"), Some(BotCommand::Merge));
    }
}
