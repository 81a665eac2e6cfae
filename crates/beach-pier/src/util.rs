use rand::Rng;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const TOKEN_LEN: usize = 11;

/// Checks a requested identity: alphanumeric segments joined by a single
/// `-`, `_` or space. The empty string asks the server to assign one.
pub fn validate_id(id: &str) -> bool {
    if id.is_empty() {
        return true;
    }
    let mut after_separator = true;
    for ch in id.chars() {
        if ch.is_ascii_alphanumeric() {
            after_separator = false;
        } else if matches!(ch, '-' | '_' | ' ') {
            if after_separator {
                return false;
            }
            after_separator = true;
        } else {
            return false;
        }
    }
    !after_separator
}

/// Lowercase base-36 token used for session tokens and generated ids.
pub fn random_token() -> String {
    let mut rng = rand::thread_rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

pub(crate) fn prefixed_id(prefix: &str) -> String {
    format!("{prefix}{}", random_token())
}
