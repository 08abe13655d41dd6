//! INT 2Fh log output, kept in its own binary because it reroutes the
//! global log sink

use emu_core::logging::{LogCategory, LogConfig, LogLevel};
use emu_dos::{DosTask, DpmiConfig, NativeContext};
use std::time::{Duration, Instant};

#[test]
fn test_int2f_logs_requested_function() {
    let path = std::env::temp_dir().join(format!("emu_dos_int2f_{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let config = LogConfig::global();
    config.set_level(LogCategory::Dpmi, LogLevel::Debug);
    config.set_log_file(path.clone()).unwrap();

    let mut task = DosTask::new(DpmiConfig::default()).unwrap();
    let mut ctx = NativeContext::real_mode(0x1000, 0);
    ctx.set_ax(0x1687);
    assert!(task.handle_int2f(&mut ctx));
    assert_eq!(ctx.ax(), 0);
    config.clear_log_file();

    // The writer thread drains its queue after the sink is dropped
    let deadline = Instant::now() + Duration::from_secs(5);
    let text = loop {
        let text = std::fs::read_to_string(&path).unwrap_or_default();
        if text.contains("INT 2Fh") || Instant::now() > deadline {
            break text;
        }
        std::thread::sleep(Duration::from_millis(10));
    };
    let _ = std::fs::remove_file(&path);

    assert!(text.contains("INT 2Fh AX=1687 handled"), "log was: {}", text);
    assert!(!text.contains("INT 2Fh AX=0000"));
}
