#![no_main]

use libfuzzer_sys::fuzz_target;
use vitals::config::Config;

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    let _ = Config::from_yaml_str(&input);
});
