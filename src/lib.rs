
pub mod utils;
pub mod logging;
pub mod defaultlogger;

pub mod callback;
pub mod binpack;
pub mod elements;

pub mod osmread;
pub mod featuresort;
