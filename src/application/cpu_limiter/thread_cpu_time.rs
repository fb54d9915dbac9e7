//! Per-thread CPU-time clocks.
//!
//! The limiter's watcher samples how much CPU time each registered worker
//! has accumulated. POSIX exposes this through a per-thread clock id;
//! Windows through `GetThreadTimes`. Reads can fail transiently (e.g. while
//! a thread is tearing down), so `cpu_time` returns `io::Result` and the
//! watcher treats failures as a missing sample.

#[cfg(unix)]
mod imp {
    use std::io;
    use std::os::unix::thread::JoinHandleExt;
    use std::thread::JoinHandle;
    use std::time::Duration;

    /// Handle to a worker thread's CPU-time clock.
    #[derive(Clone, Copy, Debug)]
    pub struct ThreadCpuClock {
        pthread: libc::pthread_t,
    }

    impl ThreadCpuClock {
        pub fn for_thread<T>(handle: &JoinHandle<T>) -> Self {
            Self {
                pthread: handle.as_pthread_t(),
            }
        }

        /// Accumulated user+kernel CPU time of the thread.
        ///
        /// Only meaningful while the thread is alive; the miner joins its
        /// workers only after the limiter has stopped sampling.
        pub fn cpu_time(&self) -> io::Result<Duration> {
            let mut clock_id: libc::clockid_t = 0;
            let rc = unsafe { libc::pthread_getcpuclockid(self.pthread, &mut clock_id) };
            if rc != 0 {
                return Err(io::Error::from_raw_os_error(rc));
            }

            let mut ts = libc::timespec {
                tv_sec: 0,
                tv_nsec: 0,
            };
            if unsafe { libc::clock_gettime(clock_id, &mut ts) } != 0 {
                return Err(io::Error::last_os_error());
            }

            Ok(Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32))
        }
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use std::os::windows::io::AsRawHandle;
    use std::thread::JoinHandle;
    use std::time::Duration;

    use windows_sys::Win32::Foundation::FILETIME;
    use windows_sys::Win32::System::Threading::GetThreadTimes;

    /// Handle to a worker thread's CPU-time clock.
    #[derive(Clone, Copy, Debug)]
    pub struct ThreadCpuClock {
        raw_handle: isize,
    }

    // The raw handle is only dereferenced by GetThreadTimes, which is safe
    // to call from any thread while the target thread has not been joined.
    unsafe impl Send for ThreadCpuClock {}
    unsafe impl Sync for ThreadCpuClock {}

    impl ThreadCpuClock {
        pub fn for_thread<T>(handle: &JoinHandle<T>) -> Self {
            Self {
                raw_handle: handle.as_raw_handle() as isize,
            }
        }

        /// Accumulated user+kernel CPU time of the thread, in the 100 ns
        /// units `GetThreadTimes` reports.
        pub fn cpu_time(&self) -> io::Result<Duration> {
            let mut creation = zero_filetime();
            let mut exit = zero_filetime();
            let mut kernel = zero_filetime();
            let mut user = zero_filetime();
            let ok = unsafe {
                GetThreadTimes(
                    self.raw_handle as _,
                    &mut creation,
                    &mut exit,
                    &mut kernel,
                    &mut user,
                )
            };
            if ok == 0 {
                return Err(io::Error::last_os_error());
            }

            let total_100ns = filetime_to_u64(&kernel) + filetime_to_u64(&user);
            Ok(Duration::from_nanos(total_100ns * 100))
        }
    }

    fn zero_filetime() -> FILETIME {
        FILETIME {
            dwLowDateTime: 0,
            dwHighDateTime: 0,
        }
    }

    fn filetime_to_u64(ft: &FILETIME) -> u64 {
        (u64::from(ft.dwHighDateTime) << 32) | u64::from(ft.dwLowDateTime)
    }
}

pub use imp::ThreadCpuClock;
