use std::cell::RefCell;
use std::io::{self, Write};
use std::rc::Rc;

/// Output sink that keeps everything written to it in memory.
///
/// Clones share the same buffer, so a caller can hand one clone to the
/// machine and read the program's output through the other.
#[derive(Debug, Clone, Default)]
pub struct SharedOutput(Rc<RefCell<Vec<u8>>>);

impl SharedOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0.borrow()).into_owned()
    }

    pub fn clear(&self) {
        self.0.borrow_mut().clear();
    }
}

impl Write for SharedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_share_buffer() {
        let out = SharedOutput::new();
        let mut writer = out.clone();
        writer.write_all(b"hi").unwrap();
        assert_eq!(out.contents(), b"hi");
        out.clear();
        assert_eq!(out.to_string_lossy(), "");
    }
}
