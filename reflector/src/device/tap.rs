//! Multi-queue TAP device
//!
//! Each queue is its own file descriptor attached to the same interface
//! (`IFF_MULTI_QUEUE`). Descriptors are non-blocking so a worker can poll
//! its queue without ever sleeping in the kernel.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use nix::libc;
use tracing::{debug, info};

use super::PacketQueue;
use crate::dataplane::buffer::{BufferPool, PacketBuffer, PoolBuffer};

/// TAP device flags from linux/if_tun.h
const IFF_TAP: libc::c_short = 0x0002;
const IFF_NO_PI: libc::c_short = 0x1000;
const IFF_MULTI_QUEUE: libc::c_short = 0x0100;

/// ioctl request code for TUNSETIFF
const TUNSETIFF: libc::c_ulong = 0x400454ca;

/// ifreq structure for TUN/TAP configuration and interface flags
#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    ifr_flags: libc::c_short,
    _pad: [u8; 22], // padding to match kernel struct size
}

impl IfReq {
    fn new(name: &str, flags: libc::c_short) -> io::Result<Self> {
        let name_bytes = name.as_bytes();
        if name_bytes.is_empty() || name_bytes.len() >= libc::IFNAMSIZ {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid interface name {name:?}"),
            ));
        }
        let mut ifr = IfReq {
            ifr_name: [0; libc::IFNAMSIZ],
            ifr_flags: flags,
            _pad: [0; 22],
        };
        for (i, &b) in name_bytes.iter().enumerate() {
            ifr.ifr_name[i] = b as libc::c_char;
        }
        Ok(ifr)
    }
}

/// RAII guard for socket fd
struct SockGuard(RawFd);

impl Drop for SockGuard {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

/// A multi-queue TAP interface
pub struct TapDevice {
    name: String,
    queues: Vec<TapQueue>,
}

impl TapDevice {
    /// Create (or attach to) TAP interface `name` with `queues` queues and
    /// bring it up. Received frames are read into buffers from `pool`.
    pub fn open(name: &str, queues: u16, pool: Arc<BufferPool>) -> io::Result<Self> {
        if queues == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "TAP device needs at least one queue",
            ));
        }

        let mut opened = Vec::with_capacity(queues as usize);
        for queue in 0..queues {
            let file = Self::open_queue(name)?;
            debug!(name, queue, fd = file.as_raw_fd(), "TAP queue attached");
            opened.push(TapQueue {
                queue,
                file,
                pool: Arc::clone(&pool),
                rx_nombuf: 0,
            });
        }

        let dev = Self {
            name: name.to_string(),
            queues: opened,
        };
        dev.bring_up()?;
        info!(name, queues, "TAP device ready");
        Ok(dev)
    }

    fn open_queue(name: &str) -> io::Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open("/dev/net/tun")?;

        let ifr = IfReq::new(name, IFF_TAP | IFF_NO_PI | IFF_MULTI_QUEUE)?;
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), TUNSETIFF as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(file)
    }

    /// Set IFF_UP on the interface.
    fn bring_up(&self) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        let sock_guard = SockGuard(sock);

        let mut ifr = IfReq::new(&self.name, 0)?;

        // SIOCGIFFLAGS
        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCGIFFLAGS as _, &mut ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }

        ifr.ifr_flags |= libc::IFF_UP as libc::c_short;

        // SIOCSIFFLAGS
        let ret = unsafe { libc::ioctl(sock_guard.0, libc::SIOCSIFFLAGS as _, &ifr) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_queues(&self) -> u16 {
        self.queues.len() as u16
    }

    /// Split the device into its queues, in queue order.
    pub fn into_queues(self) -> Vec<TapQueue> {
        self.queues
    }
}

/// One queue of a [`TapDevice`]
pub struct TapQueue {
    queue: u16,
    file: File,
    pool: Arc<BufferPool>,
    rx_nombuf: u64,
}

impl TapQueue {
    pub fn queue(&self) -> u16 {
        self.queue
    }
}

impl PacketQueue for TapQueue {
    fn rx_burst(&mut self, out: &mut Vec<PoolBuffer>, max: usize) -> io::Result<usize> {
        let mut received = 0;
        while received < max {
            let Some(mut buf) = self.pool.alloc() else {
                self.rx_nombuf += 1;
                break;
            };
            match self.file.read(buf.write_area()) {
                Ok(0) => break,
                Ok(n) => {
                    buf.set_len(n);
                    out.push(buf);
                    received += 1;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if received == 0 => return Err(e),
                Err(_) => break,
            }
        }
        Ok(received)
    }

    fn tx_burst(&mut self, pkts: &mut Vec<PoolBuffer>) -> io::Result<usize> {
        let mut sent = 0;
        let mut result = Ok(());
        for buf in pkts.iter() {
            match self.file.write(buf.data()) {
                Ok(_) => sent += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        pkts.drain(..sent);
        match result {
            Err(e) if sent == 0 => Err(e),
            _ => Ok(sent),
        }
    }

    fn take_rx_nombuf(&mut self) -> u64 {
        std::mem::take(&mut self.rx_nombuf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ifreq_name() {
        let ifr = IfReq::new("refl0", IFF_TAP).unwrap();
        assert_eq!(ifr.ifr_name[0], b'r' as libc::c_char);
        assert_eq!(ifr.ifr_name[4], b'0' as libc::c_char);
        assert_eq!(ifr.ifr_name[5], 0);
        assert_eq!(ifr.ifr_flags, IFF_TAP);
    }

    #[test]
    fn test_ifreq_rejects_long_name() {
        let name = "x".repeat(libc::IFNAMSIZ);
        assert!(IfReq::new(&name, 0).is_err());
        assert!(IfReq::new("", 0).is_err());
    }

    #[test]
    fn test_open_rejects_zero_queues() {
        let pool = Arc::new(BufferPool::new(4, 2048).unwrap());
        assert!(TapDevice::open("refl-test", 0, pool).is_err());
    }

    // Note: creating a TAP device requires CAP_NET_ADMIN
}
