#![no_main]

use libfuzzer_sys::fuzz_target;
use vitals::syscalls::SyscallTable;

fuzz_target!(|data: &[u8]| {
    let input = String::from_utf8_lossy(data);
    let table = SyscallTable::parse(&input);
    let _ = table.name_for(0);
});
