//! Application listeners.

use warden_model::ApplicationInfo;

/// Callback interface for application lifecycle changes.
///
/// Listeners are invoked *after* the change has been persisted — a listener
/// never observes state the manager could still lose on a crash.
pub trait ApplicationListener: Send + Sync {
    /// An application's descriptor changed. `old` is `None` on first
    /// discovery; `new` carries the current descriptor.
    fn on_application_changed(&self, old: Option<&ApplicationInfo>, new: &ApplicationInfo);

    /// An application was removed (reset) together with its certificates.
    fn on_application_removed(&self, app: &ApplicationInfo) {
        let _ = app;
    }
}
