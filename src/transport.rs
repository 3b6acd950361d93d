//! Byte-level link between the host and the radio stick.

/// Backend carrying stick commands and replies (USB CDC serial, USB bulk,
/// a scripted mock...).
pub trait StickTransport {
    type Error: std::fmt::Debug;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error>;

    /// Wait up to `timeout_ms` for reply bytes. `Ok(0)` means the stick
    /// stayed silent.
    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error>;

    /// Drop stale bytes before a new command
    fn clear_input(&mut self) -> Result<(), Self::Error>;
}

/// Lets a [`Stick`](crate::Stick) borrow a transport owned elsewhere
impl<T: StickTransport + ?Sized> StickTransport for &mut T {
    type Error = T::Error;

    fn write(&mut self, data: &[u8]) -> Result<usize, Self::Error> {
        (**self).write(data)
    }

    fn read(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, Self::Error> {
        (**self).read(buf, timeout_ms)
    }

    fn clear_input(&mut self) -> Result<(), Self::Error> {
        (**self).clear_input()
    }
}
