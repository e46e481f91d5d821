//! Shared helpers for integration tests
//!
//! The memory-map oracle reads `/proc/self/maps`. A released range can be
//! handed out again by the next mapping anywhere in the process, so every
//! test in a file that asserts "unmapped" takes [`serial`] first.

#![allow(dead_code)]

use lazy_static::lazy_static;
use parking_lot::{Mutex, MutexGuard};

lazy_static! {
    static ref SERIAL: Mutex<()> = Mutex::new(());
}

/// Runs tests of one binary one at a time
pub fn serial() -> MutexGuard<'static, ()> {
    SERIAL.lock()
}

/// True if `/proc/self/maps` lists a mapping containing `address`
#[cfg(target_os = "linux")]
pub fn is_mapped(address: usize) -> bool {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("read /proc/self/maps");
    maps.lines().any(|line| {
        let range = line.split_whitespace().next().unwrap_or("");
        let Some((start, end)) = range.split_once('-') else {
            return false;
        };
        match (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) {
            (Ok(start), Ok(end)) => start <= address && address < end,
            _ => false,
        }
    })
}

/// True if `address` lies in an anonymous executable mapping, i.e. one that
/// could be a code region
///
/// Other threads' heaps and stacks may legitimately land on a released code
/// range; they are never anonymous and executable at the same time.
#[cfg(target_os = "linux")]
pub fn is_code_mapped(address: usize) -> bool {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("read /proc/self/maps");
    maps.lines().any(|line| {
        let mut fields = line.split_whitespace();
        let range = fields.next().unwrap_or("");
        let perms = fields.next().unwrap_or("");
        // offset, device, inode, then an optional path
        let path = fields.nth(3);
        let Some((start, end)) = range.split_once('-') else {
            return false;
        };
        let contains = match (
            usize::from_str_radix(start, 16),
            usize::from_str_radix(end, 16),
        ) {
            (Ok(start), Ok(end)) => start <= address && address < end,
            _ => false,
        };
        contains && perms.contains('x') && path.is_none()
    })
}

/// Without an oracle every address counts as mapped while alive and
/// unmapped after release, so the checks degrade to no-ops
#[cfg(not(target_os = "linux"))]
pub fn is_mapped(_address: usize) -> bool {
    true
}

#[cfg(not(target_os = "linux"))]
pub fn is_code_mapped(_address: usize) -> bool {
    false
}

/// Panics unless `address` is mapped
pub fn assert_mapped(address: usize, context: &str) {
    assert!(
        is_mapped(address),
        "{}: expected mapped address {:#x}",
        context,
        address
    );
}

/// Panics if `address` is still mapped
pub fn assert_unmapped(address: usize, context: &str) {
    if cfg!(target_os = "linux") {
        assert!(
            !is_mapped(address),
            "{}: expected unmapped address {:#x}",
            context,
            address
        );
    }
}

/// Module with a one-page memory and a data segment holding `payload`
pub fn data_module(payload: &str) -> String {
    format!(
        r#"(module (memory (export "mem") 1) (data (i32.const 0) "{}") (func (export "f")))"#,
        payload
    )
}

/// Module exporting a function that returns 42
pub const ANSWER: &str = r#"(module (func (export "test") (result i32) i32.const 42))"#;

/// Module mixing memory, data and a function
pub fn pressure_module(tag: &str) -> String {
    format!(
        r#"(module (memory (export "mem") 1) (data (i32.const 0) "{}")
             (func (export "test") (result i32) i32.const 42))"#,
        tag
    )
}
