use indicatif::{ProgressBar, ProgressStyle};

use crate::logging::{set_boxed_messenger, Messenger, ProgressBytes, ProgressPercent};

pub struct ProgressBytesDefault {
    pb: ProgressBar,
}

impl ProgressBytesDefault {
    pub fn new(message: &str, total_bytes: u64) -> Box<dyn ProgressBytes> {
        let pb = ProgressBar::new(total_bytes);
        pb.set_style(ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:100.cyan/blue}] {bytes} / {total_bytes} ({eta_precise}) {msg}")
            .expect("?")
            .progress_chars("#>-"));

        pb.set_message(String::from(message));

        Box::new(ProgressBytesDefault { pb: pb })
    }
}

impl ProgressBytes for ProgressBytesDefault {
    fn change_message(&self, new_message: &str) {
        self.pb.set_message(String::from(new_message));
    }

    fn progress_bytes(&self, bytes: u64) {
        self.pb.set_position(bytes);
    }
    fn finish(&self) {
        self.pb.finish();
    }
}

pub struct ProgressPercentDefault {
    pb: ProgressBar,
}

impl ProgressPercentDefault {
    pub fn new(message: &str) -> Box<dyn ProgressPercent> {
        let pb = ProgressBar::new(1000);
        pb.set_style(ProgressStyle::with_template(
            "{spinner:.green} [{elapsed_precise}] [{bar:100.cyan/blue}] {percent:>4}% ({eta_precise}) {msg}")
            .expect("?")
            .progress_chars("#>-"));
        pb.set_message(String::from(message));

        Box::new(ProgressPercentDefault { pb: pb })
    }
}

impl ProgressPercent for ProgressPercentDefault {
    fn change_message(&self, new_message: &str) {
        self.pb.set_message(String::from(new_message));
    }

    fn progress_percent(&self, percent: f64) {
        self.pb.set_position((percent * 10.0) as u64);
    }
    fn finish(&self) {
        self.pb.finish();
    }
}

pub struct MessengerDefault;

impl MessengerDefault {
    pub fn new() -> MessengerDefault {
        MessengerDefault
    }
}

impl Messenger for MessengerDefault {
    fn message(&self, message: &str) {
        println!("{}", message);
    }

    fn start_progress_bytes(&self, message: &str, total_bytes: u64) -> Box<dyn ProgressBytes> {
        ProgressBytesDefault::new(message, total_bytes)
    }

    fn start_progress_percent(&self, message: &str) -> Box<dyn ProgressPercent> {
        ProgressPercentDefault::new(message)
    }
}

pub fn register_messenger_default() -> std::io::Result<()> {
    set_boxed_messenger(Box::new(MessengerDefault::new()))
}
