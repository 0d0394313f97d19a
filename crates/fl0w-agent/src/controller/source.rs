//! Where sensor values come from.
//!
//! Hardware is probed once by [`detect`]; if the controller library cannot be
//! bound the synthetic source is used for the rest of the process lifetime.

use std::sync::Arc;

use fl0w_core::sensor::{ANALOG_MAX_VALUE, DIGITAL_MAX_VALUE};
use fl0w_core::{Port, SensorMode};
use rand::Rng;
use tracing::{info, warn};

/// Reads one sensor port.
pub trait SensorSource: Send + Sync {
    fn read(&self, mode: SensorMode, port: Port) -> i32;

    /// Short name used in logs.
    fn name(&self) -> &'static str;
}

/// Uniform random readings in each mode's value range.
#[derive(Debug, Default, Clone, Copy)]
pub struct SyntheticSource;

impl SensorSource for SyntheticSource {
    fn read(&self, mode: SensorMode, _port: Port) -> i32 {
        let max = match mode {
            SensorMode::Analog => ANALOG_MAX_VALUE,
            SensorMode::Digital => DIGITAL_MAX_VALUE,
        };
        rand::thread_rng().gen_range(0..=max)
    }

    fn name(&self) -> &'static str {
        "synthetic"
    }
}

/// Probes for sensor hardware once and picks the source for this process.
pub fn detect() -> Arc<dyn SensorSource> {
    match hardware::load() {
        Ok(source) => {
            info!(source = source.name(), "Sensor hardware available");
            Arc::new(source)
        }
        Err(reason) => {
            warn!(reason = %reason, "Sensor hardware unavailable, using synthetic readings");
            Arc::new(SyntheticSource)
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "arm"))]
mod hardware {
    use std::os::raw::{c_char, c_int};

    use fl0w_core::{Port, SensorMode};

    use super::SensorSource;

    const LIBRARY: &[u8] = b"/usr/lib/libwallaby.so\0";
    const ANALOG_SYMBOL: &[u8] = b"analog\0";
    const DIGITAL_SYMBOL: &[u8] = b"digital\0";

    type ReadFn = unsafe extern "C" fn(c_int) -> c_int;

    /// Readings through the controller's `libwallaby`.
    pub struct WallabySource {
        analog: ReadFn,
        digital: ReadFn,
    }

    impl SensorSource for WallabySource {
        fn read(&self, mode: SensorMode, port: Port) -> i32 {
            let read = match mode {
                SensorMode::Analog => self.analog,
                SensorMode::Digital => self.digital,
            };
            // SAFETY: both symbols take a port number and return a reading.
            unsafe { read(c_int::from(port)) }
        }

        fn name(&self) -> &'static str {
            "libwallaby"
        }
    }

    /// Binds the library; the handle stays open for the process lifetime.
    pub fn load() -> Result<WallabySource, String> {
        // SAFETY: dlopen/dlsym are called with NUL-terminated names and the
        // returned pointers are checked before use.
        unsafe {
            let handle = libc::dlopen(LIBRARY.as_ptr().cast::<c_char>(), libc::RTLD_NOW);
            if handle.is_null() {
                return Err("cannot open /usr/lib/libwallaby.so".to_string());
            }

            let analog = libc::dlsym(handle, ANALOG_SYMBOL.as_ptr().cast::<c_char>());
            let digital = libc::dlsym(handle, DIGITAL_SYMBOL.as_ptr().cast::<c_char>());
            if analog.is_null() || digital.is_null() {
                libc::dlclose(handle);
                return Err("libwallaby is missing analog/digital".to_string());
            }

            Ok(WallabySource {
                analog: std::mem::transmute::<*mut libc::c_void, ReadFn>(analog),
                digital: std::mem::transmute::<*mut libc::c_void, ReadFn>(digital),
            })
        }
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "arm")))]
mod hardware {
    use super::SyntheticSource;

    pub fn load() -> Result<SyntheticSource, String> {
        Err(format!(
            "no sensor hardware on {}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_values_in_range() {
        let source = SyntheticSource;
        for port in 0..=5 {
            let value = source.read(SensorMode::Analog, port);
            assert!((0..=ANALOG_MAX_VALUE).contains(&value));
        }
        for port in 0..=9 {
            let value = source.read(SensorMode::Digital, port);
            assert!(value == 0 || value == 1);
        }
    }

    #[cfg(not(all(target_os = "linux", target_arch = "arm")))]
    #[test]
    fn test_detect_falls_back_off_target() {
        assert_eq!(detect().name(), "synthetic");
    }
}
