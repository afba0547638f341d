use axum::Router;

/// A service module that contributes HTTP routes.
///
/// Each business module (batch, ...) implements this trait to register
/// its API endpoints. The binary entry point collects all modules and
/// merges their routes into a single Router.
pub trait Module: Send + Sync {
    /// Module name, used for logging and route prefixes.
    fn name(&self) -> &str;

    /// Return the module's routes. Modules prefix their own paths
    /// (e.g. `/batch/v1/...`); the binary merges them at the root.
    fn routes(&self) -> Router;
}
