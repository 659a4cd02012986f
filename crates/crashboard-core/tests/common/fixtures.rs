//! Sample crash reports.

pub const STACK_TRACE: &str = "Error: X\n at foo\n at bar";

/// Same tokens as [`STACK_TRACE`] with an extra blank line.
pub const STACK_TRACE_BLANK_LINE: &str = "Error: X\n\n at foo\n at bar";

pub const USB_FAULT: &str = "Segmentation fault (core dumped)\n  in usb_bulk_read\n  in t2_deploy";

/// A distinct report per index.
pub fn report(i: usize) -> String {
    format!("Error: failure-{i}\n at handler_{i}\n at main")
}

pub fn labels(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}
