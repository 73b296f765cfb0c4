/*
 * This file is part of Bridgehead.
 *
 * Copyright (C) 2025 Bridgehead contributors
 *
 * Bridgehead is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Bridgehead is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Bridgehead. If not, see <https://www.gnu.org/licenses/>.
 */

//! Serial device setup
//!
//! The tty is put in raw 8N1 mode without flow control. Reads block until at
//! least one byte arrives (`VMIN=1`, `VTIME=0`); the reader task bounds them
//! with its own timeout. The descriptor is duplicated so reads and writes can
//! run on separate tasks.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use tracing::{debug, info};

use crate::error::{BridgeError, ConfigError};

/// Map a baud rate to its termios speed constant
pub fn termios_speed(baud: u32) -> Option<libc::speed_t> {
    let speed = match baud {
        1200 => libc::B1200,
        2400 => libc::B2400,
        4800 => libc::B4800,
        9600 => libc::B9600,
        19200 => libc::B19200,
        38400 => libc::B38400,
        57600 => libc::B57600,
        115200 => libc::B115200,
        230400 => libc::B230400,
        _ => return None,
    };
    Some(speed)
}

/// Both directions of an open serial link
#[derive(Debug)]
pub struct SerialLink {
    pub reader: tokio::fs::File,
    pub writer: tokio::fs::File,
}

/// Open and configure the serial device.
pub fn open(path: &Path, baud: u32) -> Result<SerialLink, BridgeError> {
    let speed = termios_speed(baud)
        .ok_or_else(|| ConfigError::serial(format!("unsupported baud rate {}", baud)))?;
    let open_err = |source: io::Error| BridgeError::SerialOpen { path: path.to_path_buf(), source };

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .custom_flags(libc::O_NOCTTY)
        .open(path)
        .map_err(open_err)?;

    configure_raw(&file, speed).map_err(open_err)?;
    let writer = file.try_clone().map_err(open_err)?;

    info!("SERIAL: opened {} at {} baud (8N1, raw)", path.display(), baud);
    Ok(SerialLink {
        reader: tokio::fs::File::from_std(file),
        writer: tokio::fs::File::from_std(writer),
    })
}

fn configure_raw(file: &File, speed: libc::speed_t) -> io::Result<()> {
    let fd = file.as_raw_fd();

    // SAFETY: termios is a plain C struct; tcgetattr fully initializes it on success.
    let mut tio: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(fd, &mut tio) } != 0 {
        return Err(io::Error::last_os_error());
    }

    // SAFETY: tio is a valid, initialized termios owned by this frame.
    unsafe { libc::cfmakeraw(&mut tio) };
    tio.c_cflag &= !(libc::CSIZE | libc::CSTOPB | libc::PARENB | libc::CRTSCTS);
    tio.c_cflag |= libc::CS8 | libc::CLOCAL | libc::CREAD;
    tio.c_iflag &= !(libc::IXON | libc::IXOFF | libc::IXANY);
    tio.c_cc[libc::VMIN] = 1;
    tio.c_cc[libc::VTIME] = 0;

    // SAFETY: fd is open for the lifetime of `file`; tio is initialized above.
    unsafe {
        if libc::cfsetispeed(&mut tio, speed) != 0 || libc::cfsetospeed(&mut tio, speed) != 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
            return Err(io::Error::last_os_error());
        }
        // Drop whatever the board sent before we were listening
        if libc::tcflush(fd, libc::TCIOFLUSH) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    debug!("SERIAL: termios configured on fd {}", fd);
    Ok(())
}
