//! The coverage map shared between the harness and the instrumented target.
//!
//! The map lives in a SysV shared memory segment. Its id is handed to the target through
//! [`SHM_ENV_VAR`] and the instrumentation attaches it before recording the first tuple. Only
//! the target writes into it, and only while it is running.

use std::ptr::NonNull;
use std::{env, io, mem, ptr, slice};

use log::{debug, warn};
use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
use signal_hook::low_level;
use signal_hook::SigId;

use crate::config::{MAP_SIZE_ENV_VAR, SHM_ENV_VAR};
use crate::error::Error;

/// Signals after which the segment would otherwise outlive the harness.
const TERMINATION_SIGNALS: [libc::c_int; 3] = [SIGINT, SIGTERM, SIGHUP];

/// Owner of the shared memory segment.
///
/// The segment is marked for destruction when this value is dropped, so every way out of the
/// harness that unwinds or returns releases it. Termination by SIGINT, SIGTERM or SIGHUP
/// releases it from a signal handler.
#[derive(Debug)]
pub struct CoverageBitmap {
    shm_id: libc::c_int,
    size: usize,
    map: Option<NonNull<u8>>,
    signal_ids: Vec<SigId>,
}

impl CoverageBitmap {
    /// Creates a private segment of `size` bytes, readable and writable by the owner only.
    pub fn create(size: usize) -> Result<Self, Error> {
        let shm_id = unsafe {
            libc::shmget(
                libc::IPC_PRIVATE,
                size,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            )
        };

        if shm_id < 0 {
            return Err(Error::SharedMemory(format!(
                "shmget() failed: {}",
                io::Error::last_os_error()
            )));
        }

        // Released by `Drop` from here on
        let mut bitmap = Self {
            shm_id,
            size,
            map: None,
            signal_ids: Vec::with_capacity(TERMINATION_SIGNALS.len()),
        };

        bitmap.release_on_termination()?;
        debug!("Created shared memory segment {} of {} bytes", shm_id, size);

        Ok(bitmap)
    }

    /// Creates, publishes and maps a segment, the order the harness needs before forking.
    pub fn setup(size: usize) -> Result<Self, Error> {
        let mut bitmap = Self::create(size)?;
        bitmap.publish();
        bitmap.map()?;
        Ok(bitmap)
    }

    fn release_on_termination(&mut self) -> Result<(), Error> {
        for signal in TERMINATION_SIGNALS {
            let shm_id = self.shm_id;
            // Only async-signal-safe calls in here
            let id = unsafe {
                low_level::register(signal, move || {
                    libc::shmctl(shm_id, libc::IPC_RMID, ptr::null_mut());
                    let _ = low_level::emulate_default_handler(signal);
                })
            }
            .map_err(|err| {
                Error::SharedMemory(format!("failed to register handler for {signal}: {err}"))
            })?;
            self.signal_ids.push(id);
        }

        Ok(())
    }

    /// Exposes the segment to every process forked from now on.
    pub fn publish(&self) {
        env::set_var(SHM_ENV_VAR, self.shm_id.to_string());
        env::set_var(MAP_SIZE_ENV_VAR, self.size.to_string());
    }

    /// Attaches the segment to the address space of this process.
    pub fn map(&mut self) -> Result<(), Error> {
        if self.map.is_some() {
            return Ok(());
        }

        let addr = unsafe { libc::shmat(self.shm_id, ptr::null(), 0) };

        if addr as isize == -1 {
            return Err(Error::SharedMemory(format!(
                "shmat() failed: {}",
                io::Error::last_os_error()
            )));
        }

        self.map = NonNull::new(addr.cast::<u8>());
        if self.map.is_none() {
            return Err(Error::SharedMemory("shmat() returned null".to_string()));
        }

        Ok(())
    }

    pub fn shm_id(&self) -> i32 {
        self.shm_id
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// The counters, one per tuple. Empty until [`CoverageBitmap::map`] succeeded.
    ///
    /// Must not be read while a target is running: the target writes without any
    /// synchronisation and only its termination orders those writes before ours.
    pub fn as_slice(&self) -> &[u8] {
        match self.map {
            Some(map) => unsafe { slice::from_raw_parts(map.as_ptr(), self.size) },
            None => &[],
        }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        match self.map {
            Some(map) => unsafe { slice::from_raw_parts_mut(map.as_ptr(), self.size) },
            None => &mut [],
        }
    }

    /// Marks the segment for destruction. Same as dropping it.
    pub fn release(self) {
        drop(self)
    }
}

impl Drop for CoverageBitmap {
    fn drop(&mut self) {
        for id in self.signal_ids.drain(..) {
            low_level::unregister(id);
        }

        if let Some(map) = self.map.take() {
            unsafe {
                libc::shmdt(map.as_ptr().cast::<libc::c_void>());
            }
        }

        if unsafe { libc::shmctl(self.shm_id, libc::IPC_RMID, ptr::null_mut()) } < 0 {
            warn!(
                "Failed to remove shared memory segment {}: {}",
                self.shm_id,
                io::Error::last_os_error()
            );
        } else {
            debug!("Removed shared memory segment {}", self.shm_id);
        }
    }
}

/// `shm_perm.mode` bit of a segment marked for destruction that is still attached somewhere.
const SHM_DEST: libc::c_ushort = 0o1000;

/// Whether the segment is gone, or will be once the last process detaches from it.
pub fn segment_released(shm_id: i32) -> bool {
    let mut stat: libc::shmid_ds = unsafe { mem::zeroed() };
    if unsafe { libc::shmctl(shm_id, libc::IPC_STAT, &mut stat) } < 0 {
        return true;
    }
    (stat.shm_perm.mode as libc::c_ushort) & SHM_DEST != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn release_leaves_no_segment_behind() {
        for size in [8, 64, 4096, 16384, 1 << 20] {
            let mut bitmap = CoverageBitmap::create(size).unwrap();
            bitmap.map().unwrap();
            let shm_id = bitmap.shm_id();

            assert!(!segment_released(shm_id));
            bitmap.release();
            assert!(segment_released(shm_id), "segment of {size} bytes leaked");
        }
    }

    #[test_log::test]
    fn segment_attached_elsewhere_counts_as_released() {
        let mut bitmap = CoverageBitmap::create(64).unwrap();
        bitmap.map().unwrap();
        let shm_id = bitmap.shm_id();

        let other = unsafe { libc::shmat(shm_id, ptr::null(), 0) };
        assert_ne!(other as isize, -1);

        bitmap.release();
        assert!(segment_released(shm_id));

        unsafe { libc::shmdt(other) };
        assert!(segment_released(shm_id));
    }

    #[test_log::test]
    fn unmapped_bitmap_is_empty() {
        let bitmap = CoverageBitmap::create(64).unwrap();
        assert!(bitmap.as_slice().is_empty());
    }

    #[test_log::test]
    fn fresh_segment_is_zeroed_and_writable() {
        let mut bitmap = CoverageBitmap::create(1024).unwrap();
        bitmap.map().unwrap();
        bitmap.map().unwrap();

        assert_eq!(bitmap.as_slice().len(), 1024);
        assert!(bitmap.as_slice().iter().all(|count| *count == 0));

        bitmap.as_mut_slice()[1023] = 7;
        assert_eq!(bitmap.as_slice()[1023], 7);
    }

    #[test_log::test]
    fn publish_exports_id_and_size() {
        let bitmap = CoverageBitmap::create(256).unwrap();
        bitmap.publish();

        assert_eq!(
            env::var(SHM_ENV_VAR).unwrap(),
            bitmap.shm_id().to_string()
        );
        assert_eq!(env::var(MAP_SIZE_ENV_VAR).unwrap(), "256");
    }
}
