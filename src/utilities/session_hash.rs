use rand::Rng;
use rand::distr::Alphanumeric;

const HANDLE_LENGTH: usize = 11;

/// generates the opaque handle correlating one queue submission with its polls
pub fn generate() -> String {
    rand::rng().sample_iter(Alphanumeric).take(HANDLE_LENGTH).map(char::from).collect()
}
