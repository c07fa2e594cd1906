//! Local bus driver for the Linux `i2c-dev` character devices.
//!
//! Each transaction is submitted as one `I2C_RDWR` ioctl, so the kernel
//! issues the read with a repeated start right after the write.

#![allow(unsafe_code)]

use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use crate::bus::{Bus, Frequency};

/// `ioctl` request: combined read/write transfer.
const I2C_RDWR: libc::c_ulong = 0x0707;
/// Message flag: read from the device.
const I2C_M_RD: u16 = 0x0001;
/// Message flag: 10-bit device address.
const I2C_M_TEN: u16 = 0x0010;

/// Mirror of `struct i2c_msg` from `<linux/i2c.h>`.
#[repr(C)]
#[allow(dead_code)]
struct I2cMsg {
    addr: u16,
    flags: u16,
    len: u16,
    buf: *mut u8,
}

/// Mirror of `struct i2c_rdwr_ioctl_data` from `<linux/i2c-dev.h>`.
#[repr(C)]
#[allow(dead_code)]
struct I2cRdwrData {
    msgs: *mut I2cMsg,
    nmsgs: u32,
}

/// An open `/dev/i2c-N` device.
#[derive(Debug)]
pub struct I2cDev {
    file: File,
    path: PathBuf,
}

impl I2cDev {
    /// Opens a bus by name.
    ///
    /// `""` picks the lowest-numbered bus present, `"1"` means
    /// `/dev/i2c-1`, and anything else is taken as a device path.
    pub fn open(name: &str) -> io::Result<Self> {
        let path = if name.is_empty() {
            first_bus()?
        } else if name.bytes().all(|b| b.is_ascii_digit()) {
            PathBuf::from(format!("/dev/i2c-{name}"))
        } else {
            PathBuf::from(name)
        };
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        Ok(Self { file, path })
    }

    /// Path of the device node.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Finds the lowest-numbered `/dev/i2c-*` node.
fn first_bus() -> io::Result<PathBuf> {
    let mut buses: Vec<(u32, PathBuf)> = fs::read_dir("/dev")?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name();
            let n = name.to_str()?.strip_prefix("i2c-")?.parse().ok()?;
            Some((n, e.path()))
        })
        .collect();
    buses.sort();
    buses
        .into_iter()
        .next()
        .map(|(_, p)| p)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no I2C bus found under /dev"))
}

impl Bus for I2cDev {
    type Error = io::Error;

    fn describe(&self) -> io::Result<String> {
        Ok(self.path.display().to_string())
    }

    fn tx(&mut self, addr: u16, write: &[u8], read: &mut [u8]) -> io::Result<()> {
        let too_long =
            |_| io::Error::new(io::ErrorKind::InvalidInput, "transfer exceeds 65535 bytes");
        let flags = if addr > 0x7F { I2C_M_TEN } else { 0 };

        let mut msgs = Vec::with_capacity(2);
        if !write.is_empty() {
            msgs.push(I2cMsg {
                addr,
                flags,
                len: u16::try_from(write.len()).map_err(too_long)?,
                // The kernel only reads from a message without I2C_M_RD.
                buf: write.as_ptr().cast_mut(),
            });
        }
        if !read.is_empty() {
            msgs.push(I2cMsg {
                addr,
                flags: flags | I2C_M_RD,
                len: u16::try_from(read.len()).map_err(too_long)?,
                buf: read.as_mut_ptr(),
            });
        }
        if msgs.is_empty() {
            return Ok(());
        }

        let mut data = I2cRdwrData {
            msgs: msgs.as_mut_ptr(),
            nmsgs: u32::try_from(msgs.len()).map_err(too_long)?,
        };
        // SAFETY: `data` points at `msgs`, whose buffers borrow `write` and
        // `read` for the duration of the call with matching lengths.
        #[allow(trivial_numeric_casts)]
        let ret = unsafe { libc::ioctl(self.file.as_raw_fd(), I2C_RDWR as _, &raw mut data) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    fn set_speed(&mut self, freq: Frequency) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!(
                "{}: i2c-dev cannot change the bus clock (requested {freq})",
                self.path.display()
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_fails_to_open() {
        let err = I2cDev::open("/nonexistent/i2c-99").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
