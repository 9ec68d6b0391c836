use rand::distributions::Alphanumeric;
use rand::Rng;

/// Random `[A-Za-z0-9]` string for generated passwords and tokens.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}
