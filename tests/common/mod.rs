//! Runs a test again in a child process so that aborts and direct writes to
//! fd 2 can be observed from the parent.

#![allow(dead_code)]

use std::process::{Command, ExitStatus};

use segmalloc::{Config, MemoryManager};

const CHILD_ENV: &str = "SEGMALLOC_TEST_CHILD";

pub fn manager(config: Config) -> &'static MemoryManager {
  Box::leak(Box::new(MemoryManager::new(&config).unwrap()))
}

pub fn is_child(test: &str) -> bool {
  std::env::var(CHILD_ENV).is_ok_and(|name| name == test)
}

/// Runs `test` alone in a child process; returns how it exited and its stderr.
pub fn run_child(test: &str) -> (ExitStatus, String) {
  let exe = std::env::current_exe().unwrap();
  let output = Command::new(exe)
    .args([test, "--exact", "--nocapture", "--test-threads=1"])
    .env(CHILD_ENV, test)
    .output()
    .unwrap();
  (output.status, String::from_utf8_lossy(&output.stderr).into_owned())
}
