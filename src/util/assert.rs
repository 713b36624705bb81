/// Panics with an internal assertion message when `condition` is false.
///
/// Reserved for states that can only be reached through a programming error,
/// such as acknowledging a batch that is not at the head of the queue.
pub fn hard_assert(condition: bool, message: impl AsRef<str>) {
    if !condition {
        fail(message);
    }
}

pub fn fail(message: impl AsRef<str>) -> ! {
    panic!("{}", assertion_error(message));
}

pub fn assertion_error(message: impl AsRef<str>) -> String {
    format!(
        "Firestore sync engine ({}) INTERNAL ASSERT FAILED: {}",
        env!("CARGO_PKG_VERSION"),
        message.as_ref()
    )
}
