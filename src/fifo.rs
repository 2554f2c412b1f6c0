/// Fixed-capacity byte ring. Holds exactly `N` bytes when full.
pub struct Fifo<const N: usize> {
    buffer: [u8; N],
    head: usize,
    len: usize,
}

impl<const N: usize> Default for Fifo<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Fifo<N> {
    pub const fn new() -> Self {
        Fifo {
            buffer: [0; N],
            head: 0,
            len: 0,
        }
    }

    pub fn reset(&mut self) {
        self.head = 0;
        self.len = 0;
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    pub fn data_len(&self) -> usize {
        self.len
    }

    pub fn avail_len(&self) -> usize {
        N - self.len
    }

    /// Appends as many bytes of `data` as fit and returns how many were taken.
    pub fn push(&mut self, data: &[u8]) -> usize {
        let count = data.len().min(self.avail_len());
        let mut tail = (self.head + self.len) % N.max(1);

        for &byte in &data[..count] {
            self.buffer[tail] = byte;
            tail = (tail + 1) % N;
        }

        self.len += count;
        count
    }

    /// Moves up to `out.len()` bytes out in FIFO order.
    pub fn pop(&mut self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);

        for slot in &mut out[..count] {
            *slot = self.buffer[self.head];
            self.head = (self.head + 1) % N;
        }

        self.len -= count;
        if self.len == 0 {
            self.head = 0;
        }
        count
    }

    /// Copies up to `out.len()` bytes without consuming them.
    pub fn peek(&self, out: &mut [u8]) -> usize {
        let count = out.len().min(self.len);
        let mut index = self.head;

        for slot in &mut out[..count] {
            *slot = self.buffer[index];
            index = (index + 1) % N;
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_stops_at_capacity() {
        let mut fifo: Fifo<4> = Fifo::new();
        assert_eq!(fifo.push(b"abcdef"), 4);
        assert_eq!(fifo.data_len(), 4);
        assert_eq!(fifo.avail_len(), 0);
        assert_eq!(fifo.push(b"x"), 0);
    }

    #[test]
    fn test_wraparound_keeps_order() {
        let mut fifo: Fifo<5> = Fifo::new();
        let mut out = [0u8; 8];

        fifo.push(b"abc");
        assert_eq!(fifo.pop(&mut out[..2]), 2);
        assert_eq!(&out[..2], b"ab");

        assert_eq!(fifo.push(b"defg"), 4);
        assert_eq!(fifo.data_len(), 5);

        assert_eq!(fifo.pop(&mut out), 5);
        assert_eq!(&out[..5], b"cdefg");
        assert_eq!(fifo.data_len(), 0);
    }

    #[test]
    fn test_peek_does_not_consume() {
        let mut fifo: Fifo<8> = Fifo::new();
        fifo.push(b"hi");

        let mut out = [0u8; 2];
        assert_eq!(fifo.peek(&mut out), 2);
        assert_eq!(&out, b"hi");
        assert_eq!(fifo.data_len(), 2);
    }

    #[test]
    fn test_zero_capacity_accepts_nothing() {
        let mut fifo: Fifo<0> = Fifo::new();
        assert_eq!(fifo.push(b"a"), 0);
        assert_eq!(fifo.pop(&mut [0u8; 1]), 0);
    }
}
