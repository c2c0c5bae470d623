//! Blocking transport contract
//!
//! Every operation blocks the calling thread and none of them retry. All
//! methods take `&self`: one transport may be shared between a reader blocked
//! in [`Transport::read_multi`] and another thread that closes it.

use crate::backend::DeviceBackend;
use crate::error::Result;
use std::sync::Arc;

pub trait Transport: Send + Sync {
    /// Claim `device` and prepare the transport for transfers
    fn open(&self, device: Arc<dyn DeviceBackend>) -> Result<()>;

    /// Release everything the session holds; closing twice is a no-op
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Send `buf`, returning the number of bytes written
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Receive into `buf`, returning the number of bytes read
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Send the whole vector
    fn write_vec(&self, data: Vec<u8>) -> Result<usize> {
        self.write(&data)
    }

    /// Read into `data`, truncating it to the bytes actually received
    fn read_vec(&self, data: &mut Vec<u8>) -> Result<usize> {
        let n = self.read(data.as_mut_slice())?;
        data.truncate(n);
        Ok(n)
    }

    /// Start a pipeline of `count` outstanding reads of `size` bytes
    fn prepare_multi(&self, _size: usize, _count: usize) -> Result<()> {
        Ok(())
    }

    fn free_multi(&self) -> Result<()> {
        Ok(())
    }

    /// Read the oldest pipelined transfer, or fall back to [`read`](Self::read)
    fn read_multi(&self, buf: &mut [u8]) -> Result<usize> {
        self.read(buf)
    }

    fn multi_active(&self) -> bool {
        false
    }

    /// Requests currently queued in the pipeline
    fn queued(&self) -> usize {
        0
    }
}
