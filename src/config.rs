//! Settings for one flashing session, built once from the command line.

/// Immutable run configuration passed to [`crate::Flashing`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Send the INIT byte; clear to resume an already synchronised link
    pub init: bool,
    /// Read back every written block
    pub verify: bool,
    /// Rewrites of a block that failed verification before giving up
    pub retries: u32,
    /// Reset the device once the operation is done
    pub reset: bool,
    pub show_progress: bool,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            init: true,
            verify: false,
            retries: 10,
            reset: true,
            show_progress: true,
        }
    }
}
