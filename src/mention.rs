use crate::platform::{BotIdentity, IncomingMessage, MessageEntity};

/// True when one of the "mention" entities in `text` is the bot's token.
pub fn mentions_token(text: &str, entities: &[MessageEntity], token: &str) -> bool {
    let token = token.trim();
    entities
        .iter()
        .filter(|e| e.kind == "mention")
        .filter_map(|e| e.slice(text))
        .any(|mention| mention.eq_ignore_ascii_case(token))
}

pub fn is_reply_to_bot(message: &IncomingMessage, bot: &BotIdentity) -> bool {
    message
        .reply_to
        .as_ref()
        .and_then(|reply| reply.sender.as_ref())
        .is_some_and(|sender| sender.id == bot.id)
}

/// A message addresses the bot when it mentions the token or replies to the bot.
pub fn is_addressed(message: &IncomingMessage, token: &str, bot: &BotIdentity) -> bool {
    let mentioned = message
        .body()
        .is_some_and(|(text, entities)| mentions_token(text, entities, token));
    mentioned || is_reply_to_bot(message, bot)
}

/// Strip every occurrence of the mention token and fall back to `default`
/// when nothing else is left. Matching ignores ASCII case, like [`mentions_token`].
pub fn extract_user_query(text: &str, token: &str, default: &str) -> String {
    let stripped = strip_token(text, token.trim());
    let query = stripped.split_whitespace().collect::<Vec<_>>().join(" ");
    if query.is_empty() {
        default.to_string()
    } else {
        query
    }
}

fn strip_token(text: &str, token: &str) -> String {
    if token.is_empty() {
        return text.to_string();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(pos) = find_token(rest, token) {
        out.push_str(&rest[..pos]);
        rest = &rest[pos + token.len()..];
    }
    out.push_str(rest);
    out
}

/// Byte offset of the first case-insensitive match of `token` that is not
/// the prefix of a longer username.
fn find_token(haystack: &str, token: &str) -> Option<usize> {
    let (hay, needle) = (haystack.as_bytes(), token.as_bytes());
    if needle.len() > hay.len() {
        return None;
    }
    (0..=hay.len() - needle.len()).find(|&start| {
        let end = start + needle.len();
        haystack.is_char_boundary(start)
            && haystack.is_char_boundary(end)
            && hay[start..end].eq_ignore_ascii_case(needle)
            && !hay
                .get(end)
                .is_some_and(|&next| next.is_ascii_alphanumeric() || next == b'_')
    })
}
