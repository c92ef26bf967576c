use feedback_session::SessionHooks;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Prints monitor notices to stderr so they don't mix with command output.
pub struct Notices;

impl SessionHooks for Notices {
    fn on_warning(&self, remaining: Duration) {
        eprintln!(
            "  \x1b[1;33mSession expires in {}.\x1b[0m",
            format_remaining(remaining)
        );
    }

    fn refresh(&self) -> Pin<Box<dyn Future<Output = bool> + Send>> {
        // The server has no refresh endpoint; a new login is the only way on.
        eprintln!("  \x1b[1;33mSession is about to end. Run `feedback login` to continue.\x1b[0m");
        Box::pin(std::future::ready(false))
    }
}

/// `1h 04m 09s`, `4m 09s` or `9s`.
pub fn format_remaining(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h {m:02}m {s:02}s")
    } else if m > 0 {
        format!("{m}m {s:02}s")
    } else {
        format!("{s}s")
    }
}
