//! Prompt recognition for session output streams.
//!
//! A session's prompt is not discovered — it is imposed. Right after the
//! shell channel opens, the session sends a one-time initialization line
//! that forces the remote `PS1` to a distinctive literal derived from
//! user and host. From then on, every boundary decision is an exact,
//! line-anchored match against that literal.
//!
//! The init line quote-splits the literal (`'__trl_o'\''ps...'` style
//! adjacent-string concatenation), so the command's own echo never
//! contains the literal verbatim. Combined with line anchoring, the echo
//! can never register as a boundary; the first boundary the matcher
//! reports is the first genuine prompt the remote shell emits.

mod matcher;

pub use matcher::PromptMatcher;

/// Build the prompt literal for a session.
///
/// Distinctive enough that ordinary command output is unlikely to
/// reproduce it at the start of a line, which is the accepted residual
/// risk of prompt-based boundary detection.
pub fn session_literal(username: &str, host: &str) -> String {
    let user = sanitize(username);
    let host = sanitize(host);
    format!("__trl_{user}@{host}__$ ")
}

/// Build the one-time shell initialization line for a prompt literal.
///
/// `PROMPT_COMMAND` is cleared so nothing is printed around the prompt,
/// `PS2` is emptied so continuation lines stay silent, and `PS1` is set
/// from two adjacent single-quoted halves of the literal.
pub fn init_command(literal: &str) -> String {
    let mut mid = literal.len() / 2;
    while !literal.is_char_boundary(mid) {
        mid -= 1;
    }
    let (a, b) = literal.split_at(mid);
    format!("unset PROMPT_COMMAND; export PS2=''; export PS1='{a}''{b}'\n")
}

/// Shell-quoting characters are stripped so the literal can always be
/// embedded in the single-quoted init line.
fn sanitize(part: &str) -> String {
    part.chars().filter(|c| *c != '\'' && *c != '\n').collect()
}
