/// Nice value requested for the engine thread (the "urgent audio" level).
#[cfg(target_os = "linux")]
const AUDIO_NICE: i32 = -19;

/// Best-effort priority boost for the engine thread.
///
/// On Linux this lowers the calling thread's nice value; without the needed privilege the
/// thread keeps its default priority. Elsewhere it does nothing.
pub(crate) fn enable_realtime_audio_thread() {
    #[cfg(target_os = "linux")]
    {
        // With `who == 0` the kernel applies the value to the calling thread only.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, AUDIO_NICE) };
        if rc != 0 {
            tracing::debug!(
                error = %std::io::Error::last_os_error(),
                "could not raise engine thread priority"
            );
        } else {
            tracing::debug!(nice = AUDIO_NICE, "engine thread priority raised");
        }
    }
}
