// Local port allocation for agent runtime processes.

use std::collections::BTreeSet;
use std::net::{Ipv4Addr, TcpListener};

/// Hands out ports from a fixed range. A port stays reserved from allocation
/// until [`PortAllocator::free`], which the registry calls only once the
/// owning process is confirmed dead.
#[derive(Debug)]
pub struct PortAllocator {
    start: u16,
    len: u16,
    cursor: u16,
    reserved: BTreeSet<u16>,
    check_bind: bool,
}

impl PortAllocator {
    pub fn new(start: u16, len: u16) -> Self {
        Self { start, len: len.max(1), cursor: 0, reserved: BTreeSet::new(), check_bind: true }
    }

    /// Skip the loopback bind check (in-memory hosts never listen).
    pub fn without_bind_check(mut self) -> Self {
        self.check_bind = false;
        self
    }

    /// Next free port, rotating through the range so recently freed ports are
    /// reused last.
    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..self.len {
            let offset = self.cursor;
            self.cursor = (self.cursor + 1) % self.len;
            let Some(port) = self.start.checked_add(offset) else {
                continue;
            };
            if self.reserved.contains(&port) {
                continue;
            }
            if self.check_bind && !bindable(port) {
                continue;
            }
            self.reserved.insert(port);
            return Some(port);
        }
        None
    }

    pub fn free(&mut self, port: u16) -> bool {
        self.reserved.remove(&port)
    }

    pub fn is_reserved(&self, port: u16) -> bool {
        self.reserved.contains(&port)
    }

    pub fn reserved(&self) -> Vec<u16> {
        self.reserved.iter().copied().collect()
    }

    pub fn range(&self) -> (u16, u16) {
        (self.start, self.start.saturating_add(self.len))
    }
}

fn bindable(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_ports_until_exhausted() {
        let mut ports = PortAllocator::new(40_000, 3).without_bind_check();
        let a = ports.allocate().unwrap();
        let b = ports.allocate().unwrap();
        let c = ports.allocate().unwrap();
        assert_eq!(BTreeSet::from([a, b, c]), BTreeSet::from([40_000, 40_001, 40_002]));
        assert_eq!(ports.allocate(), None);
    }

    #[test]
    fn freed_port_is_reused_only_after_free() {
        let mut ports = PortAllocator::new(40_000, 2).without_bind_check();
        let a = ports.allocate().unwrap();
        let _b = ports.allocate().unwrap();
        assert_eq!(ports.allocate(), None);

        assert!(ports.free(a));
        assert_eq!(ports.allocate(), Some(a));
        assert!(!ports.free(12));
    }

    #[test]
    fn cursor_rotates_past_recently_freed_ports() {
        let mut ports = PortAllocator::new(40_000, 4).without_bind_check();
        let first = ports.allocate().unwrap();
        ports.free(first);
        assert_ne!(ports.allocate(), Some(first));
    }

    #[test]
    fn bind_check_skips_ports_in_use() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let busy = listener.local_addr().unwrap().port();
        let mut ports = PortAllocator::new(busy, 1);
        assert_eq!(ports.allocate(), None);
    }
}
