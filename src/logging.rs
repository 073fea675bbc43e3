use std::sync::{Arc, Mutex};

// log macros to check if log and log channel is enabled before performing potentially expensive string formatting
macro_rules! log {
    ($log:expr, $($arg:tt)*) => {
        $log.log(&format!($($arg)*));
    };
}
macro_rules! warning {
    ($log:expr, $($arg:tt)*) => {
        $log.warn(&format!($($arg)*));
    };
}
macro_rules! verbose {
    ($log:expr, $($arg:tt)*) => {
        if $log.verbose_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}
macro_rules! debug {
    ($log:expr, $($arg:tt)*) => {
        if $log.debug_enabled() {
            $log.log(&format!($($arg)*));
        }
    };
}

pub(crate) use debug;
pub(crate) use log;
pub(crate) use verbose;
pub(crate) use warning;

#[derive(Default)]
pub struct Log {
    verbose: bool,
    debug: bool,
    quiet: bool,
    progress: Arc<Mutex<Option<indicatif::ProgressBar>>>,
}
impl Log {
    pub fn new(verbose: bool, debug: bool) -> Self {
        Self {
            verbose,
            debug,
            ..Default::default()
        }
    }
    /// Drops everything but warnings. Used by tests.
    pub fn quiet() -> Self {
        Self {
            quiet: true,
            ..Default::default()
        }
    }
    /// Progress bar that stays hidden for a quiet log.
    pub fn progress_bar(&self, len: u64) -> indicatif::ProgressBar {
        if self.quiet {
            indicatif::ProgressBar::hidden()
        } else {
            indicatif::ProgressBar::new(len)
        }
    }
    pub fn set_progress(&self, progress: Option<&indicatif::ProgressBar>) {
        if let Ok(mut current) = self.progress.lock() {
            *current = progress.cloned();
        }
    }
    pub fn log(&self, msg: &str) {
        if self.quiet {
            return;
        }
        match self.progress.lock().ok().as_deref() {
            Some(Some(progress)) => progress.println(msg),
            _ => println!("{msg}"),
        }
    }
    pub fn warn(&self, msg: &str) {
        match self.progress.lock().ok().as_deref() {
            Some(Some(progress)) => progress.suspend(|| eprintln!("warning: {msg}")),
            _ => eprintln!("warning: {msg}"),
        }
    }
    pub fn verbose_enabled(&self) -> bool {
        self.verbose && !self.quiet
    }
    pub fn debug_enabled(&self) -> bool {
        self.debug && !self.quiet
    }
}
