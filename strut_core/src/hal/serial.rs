//! Serial device access for the attitude stream.
//!
//! [`TtyLink`] opens a tty (typically `/dev/ttyAMA0` on the Pi header),
//! configures it to 57600 baud, 8N1, canonical mode, and exposes it as a
//! [`SerialLink`]. Canonical mode lets the kernel assemble full lines, so
//! `read_line` maps onto a single buffered read.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::termios::{
    self, BaudRate, ControlFlags, FlushArg, InputFlags, LocalFlags, OutputFlags, SetArg,
};
use tracing::debug;

use super::{DriverError, SerialLink};

fn io_error(device: &str, detail: impl std::fmt::Display) -> DriverError {
    DriverError::Io {
        device: device.to_string(),
        detail: detail.to_string(),
    }
}

/// Line-oriented serial port.
#[derive(Debug)]
pub struct TtyLink {
    reader: BufReader<File>,
    writer: File,
    path: String,
}

impl TtyLink {
    /// Open and configure the device at `path`.
    pub fn open(path: &Path) -> Result<Self, DriverError> {
        let device = path.display().to_string();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NOCTTY)
            .open(path)
            .map_err(|err| io_error(&device, err))?;

        let mut tty = termios::tcgetattr(&file).map_err(|err| io_error(&device, err))?;
        termios::cfsetspeed(&mut tty, BaudRate::B57600)
            .map_err(|err| io_error(&device, err))?;
        tty.control_flags |= ControlFlags::CREAD | ControlFlags::CLOCAL;
        tty.control_flags &= !(ControlFlags::PARENB | ControlFlags::CSTOPB | ControlFlags::CSIZE);
        tty.control_flags |= ControlFlags::CS8;
        tty.input_flags = InputFlags::IGNPAR;
        tty.output_flags = OutputFlags::empty();
        tty.local_flags = LocalFlags::ICANON;
        termios::tcflush(&file, FlushArg::TCIFLUSH).map_err(|err| io_error(&device, err))?;
        termios::tcsetattr(&file, SetArg::TCSANOW, &tty)
            .map_err(|err| io_error(&device, err))?;

        let writer = file.try_clone().map_err(|err| io_error(&device, err))?;
        debug!(device = %device, "serial port configured, 57600 8N1 canonical");

        Ok(Self {
            reader: BufReader::new(file),
            writer,
            path: device,
        })
    }
}

impl SerialLink for TtyLink {
    fn read_line(&mut self) -> Result<String, DriverError> {
        let mut line = String::new();
        let read = self
            .reader
            .read_line(&mut line)
            .map_err(|err| io_error(&self.path, err))?;
        if read == 0 {
            return Err(DriverError::NotResponding(self.path.clone()));
        }
        Ok(line)
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), DriverError> {
        self.writer
            .write_all(bytes)
            .and_then(|()| self.writer.flush())
            .map_err(|err| io_error(&self.path, err))
    }
}
