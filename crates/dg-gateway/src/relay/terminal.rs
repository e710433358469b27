//! Pseudo-terminal owned by a session channel

use std::io::{Read, Write};
use std::sync::{Mutex, MutexGuard};

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize, SlavePty};

use dg_protocol::WindowSize;

use crate::error::RelayError;
use crate::router::Invocation;

/// A process running on the slave side of a [`Terminal`]
pub struct PtyProcess {
    /// The child process
    pub child: Box<dyn Child + Send + Sync>,
    /// Reads what the process writes to its terminal
    pub reader: Box<dyn Read + Send>,
    /// Writes to the process's terminal input
    pub writer: Box<dyn Write + Send>,
}

/// Master/slave pair opened by `pty-req`
///
/// The slave is consumed by the first spawned process. The master lives
/// until [`Terminal::release`].
pub struct Terminal {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    slave: Mutex<Option<Box<dyn SlavePty + Send>>>,
    size: Mutex<WindowSize>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn pty_size(size: WindowSize) -> PtySize {
    PtySize {
        rows: size.rows.min(u16::MAX as u32) as u16,
        cols: size.cols.min(u16::MAX as u32) as u16,
        pixel_width: size.pixel_width.min(u16::MAX as u32) as u16,
        pixel_height: size.pixel_height.min(u16::MAX as u32) as u16,
    }
}

impl Terminal {
    /// Open a new pair with the given size
    pub fn open(size: WindowSize) -> Result<Self, RelayError> {
        tracing::debug!("Opening PTY {}x{}", size.cols, size.rows);

        let pair = native_pty_system()
            .openpty(pty_size(size))
            .map_err(|e| RelayError::Pty(format!("Failed to open PTY: {}", e)))?;

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            slave: Mutex::new(Some(pair.slave)),
            size: Mutex::new(size),
        })
    }

    /// Current size
    pub fn size(&self) -> WindowSize {
        *lock(&self.size)
    }

    /// Resize the terminal; a released terminal ignores this
    pub fn resize(&self, size: WindowSize) -> Result<(), RelayError> {
        *lock(&self.size) = size;

        match lock(&self.master).as_ref() {
            Some(master) => master
                .resize(pty_size(size))
                .map_err(|e| RelayError::Pty(format!("Failed to resize PTY: {}", e))),
            None => Ok(()),
        }
    }

    /// Start `invocation` on the slave side
    pub fn spawn(&self, invocation: &Invocation) -> Result<PtyProcess, RelayError> {
        let slave = lock(&self.slave)
            .take()
            .ok_or_else(|| RelayError::Pty("Terminal already in use".to_string()))?;

        let mut cmd = CommandBuilder::new(&invocation.program);
        cmd.args(&invocation.args);
        for (key, value) in &invocation.env {
            cmd.env(key, value);
        }

        let child = slave.spawn_command(cmd).map_err(|e| RelayError::Spawn {
            program: invocation.program.clone(),
            reason: e.to_string(),
        })?;
        // Only the child may hold the slave, so the reader sees EOF on exit
        drop(slave);

        let master = lock(&self.master);
        let master = master
            .as_ref()
            .ok_or_else(|| RelayError::Pty("Terminal released".to_string()))?;

        let reader = master
            .try_clone_reader()
            .map_err(|e| RelayError::Pty(format!("Failed to clone PTY reader: {}", e)))?;
        let writer = master
            .take_writer()
            .map_err(|e| RelayError::Pty(format!("Failed to take PTY writer: {}", e)))?;

        tracing::debug!("Spawned {:?} on PTY", child.process_id());

        Ok(PtyProcess {
            child,
            reader,
            writer,
        })
    }

    /// Drop both ends
    pub fn release(&self) {
        lock(&self.slave).take();
        if lock(&self.master).take().is_some() {
            tracing::debug!("PTY released");
        }
    }

    /// Whether [`Terminal::release`] has run
    pub fn is_released(&self) -> bool {
        lock(&self.master).is_none()
    }
}
