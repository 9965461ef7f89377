//! Progress and log events routed to the caller.

/// Receives transfer progress in percent (0.0 to 100.0).
pub type ProgressFn = Box<dyn Fn(f64) + Send + Sync>;
/// Receives human-readable status messages.
pub type LogFn = Box<dyn Fn(&str) + Send + Sync>;

/// Optional caller callbacks.
#[derive(Default)]
pub struct Callbacks {
    pub on_progress: Option<ProgressFn>,
    pub on_log: Option<LogFn>,
}

impl Callbacks {
    pub fn on_progress(mut self, f: impl Fn(f64) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Box::new(f));
        self
    }

    pub fn on_log(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_log = Some(Box::new(f));
        self
    }
}

/// Sends every message to both the `log` facade and the caller.
pub struct Reporter {
    callbacks: Callbacks,
}

impl Reporter {
    pub fn new(callbacks: Callbacks) -> Self {
        Reporter { callbacks }
    }

    pub fn silent() -> Self {
        Self::new(Callbacks::default())
    }

    pub fn info(&self, msg: &str) {
        log::info!("{}", msg);
        self.forward(msg);
    }

    pub fn warn(&self, msg: &str) {
        log::warn!("{}", msg);
        self.forward(msg);
    }

    pub fn progress(&self, percent: f64) {
        if let Some(f) = &self.callbacks.on_progress {
            f(percent);
        }
    }

    fn forward(&self, msg: &str) {
        if let Some(f) = &self.callbacks.on_log {
            f(msg);
        }
    }
}
