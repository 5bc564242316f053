pub mod assign;
pub mod config;
pub mod dataplane;
pub mod device;
pub mod test_util;
pub mod topology;
