use std::sync::OnceLock;

pub trait ProgressBytes {
    fn change_message(&self, new_message: &str);
    fn progress_bytes(&self, bytes: u64);
    fn finish(&self);
}

pub trait ProgressPercent {
    fn change_message(&self, new_message: &str);
    fn progress_percent(&self, percent: f64);
    fn finish(&self);
}

pub trait Messenger: Sync + Send {
    fn message(&self, message: &str);

    fn start_progress_bytes(&self, message: &str, total_bytes: u64) -> Box<dyn ProgressBytes>;
    fn start_progress_percent(&self, message: &str) -> Box<dyn ProgressPercent>;
}

static MESSENGER: OnceLock<Box<dyn Messenger>> = OnceLock::new();

pub fn set_boxed_messenger(messenger: Box<dyn Messenger>) -> std::io::Result<()> {
    match MESSENGER.set(messenger) {
        Ok(()) => Ok(()),
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            "messenger already set",
        )),
    }
}

pub fn messenger() -> &'static dyn Messenger {
    static NOP: NopMessenger = NopMessenger;
    match MESSENGER.get() {
        Some(m) => &**m,
        None => &NOP,
    }
}

struct NopMessenger;

struct NopProgress;
impl ProgressBytes for NopProgress {
    fn change_message(&self, _new_message: &str) {}
    fn progress_bytes(&self, _bytes: u64) {}
    fn finish(&self) {}
}
impl ProgressPercent for NopProgress {
    fn change_message(&self, _new_message: &str) {}
    fn progress_percent(&self, _percent: f64) {}
    fn finish(&self) {}
}

impl Messenger for NopMessenger {
    fn message(&self, _message: &str) {}

    fn start_progress_bytes(&self, _message: &str, _total_bytes: u64) -> Box<dyn ProgressBytes> {
        Box::new(NopProgress)
    }
    fn start_progress_percent(&self, _message: &str) -> Box<dyn ProgressPercent> {
        Box::new(NopProgress)
    }
}

#[macro_export]
macro_rules! message {
    ($($arg:tt)*) => {
        $crate::logging::messenger().message(&format!($($arg)*))
    };
}

#[macro_export]
macro_rules! progress_bytes {
    ($msg:expr, $total:expr) => {
        $crate::logging::messenger().start_progress_bytes($msg, $total)
    };
}

#[macro_export]
macro_rules! progress_percent {
    ($msg:expr) => {
        $crate::logging::messenger().start_progress_percent($msg)
    };
}
