/// Whether the client believes it can reach the backend, as reported to views
/// and listeners.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum OnlineState {
    /// No watch stream has succeeded or failed yet. Views still wait for the
    /// server before raising snapshots that require it.
    #[default]
    Unknown,
    Online,
    /// Connecting has failed; reads are served from cache immediately.
    Offline,
}
