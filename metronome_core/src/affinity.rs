// Copyright 2026 the Metronome Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pinning pacing threads to efficiency cores.
//!
//! Efficiency cores are the CPUs whose maximum frequency, as reported under
//! `/sys/devices/system/cpu`, is below the fastest CPU's. On a homogeneous
//! machine there are none and affinity is left alone.

use std::fs;
use std::path::Path;

use crate::settings::Settings;

const CPU_ROOT: &str = "/sys/devices/system/cpu";

/// CPUs slower than the fastest one, in ascending order.
pub(crate) fn efficiency_cores(max_freqs: &[(usize, u64)]) -> Vec<usize> {
    let Some(fastest) = max_freqs.iter().map(|&(_, f)| f).max() else {
        return Vec::new();
    };
    let mut cores: Vec<usize> = max_freqs
        .iter()
        .filter(|&&(_, f)| f < fastest)
        .map(|&(cpu, _)| cpu)
        .collect();
    cores.sort_unstable();
    cores
}

/// Reads `cpuN/cpufreq/cpuinfo_max_freq` for every CPU under `root`.
///
/// CPUs without frequency information are skipped.
pub(crate) fn read_max_frequencies(root: &Path) -> Vec<(usize, u64)> {
    let Ok(entries) = fs::read_dir(root) else {
        return Vec::new();
    };
    let mut freqs = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let Some(cpu) = name
            .to_str()
            .and_then(|n| n.strip_prefix("cpu"))
            .and_then(|n| n.parse::<usize>().ok())
        else {
            continue;
        };
        let path = entry.path().join("cpufreq/cpuinfo_max_freq");
        if let Some(freq) = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<u64>().ok())
        {
            freqs.push((cpu, freq));
        }
    }
    freqs
}

/// Pins the calling thread to the efficiency cores if `settings` asks for it.
///
/// Returns the cores the thread was pinned to, or `None` when affinity is
/// disabled, no efficiency cores exist, or the platform refused.
pub(crate) fn pin_current_thread(settings: &Settings, name: &str) -> Option<Vec<usize>> {
    if !settings.use_affinity() {
        return None;
    }
    let cores = efficiency_cores(&read_max_frequencies(Path::new(CPU_ROOT)));
    if cores.is_empty() {
        log::debug!("{name}: no efficiency cores found, affinity unchanged");
        return None;
    }
    match set_affinity(&cores) {
        Ok(()) => {
            log::info!("{name}: pinned to CPUs {cores:?}");
            Some(cores)
        }
        Err(err) => {
            log::warn!("{name}: failed to set affinity to {cores:?}: {err}");
            None
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn set_affinity(cores: &[usize]) -> nix::Result<()> {
    use nix::sched::{CpuSet, sched_setaffinity};
    use nix::unistd::Pid;

    let mut set = CpuSet::new();
    for &cpu in cores {
        set.set(cpu)?;
    }
    sched_setaffinity(Pid::from_raw(0), &set)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn set_affinity(_cores: &[usize]) -> Result<(), &'static str> {
    Err("thread affinity is not supported on this platform")
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    struct ScratchDir(PathBuf);

    impl ScratchDir {
        fn new(tag: &str) -> Self {
            let path = std::env::temp_dir()
                .join(format!("metronome-affinity-{tag}-{}", std::process::id()));
            let _ = fs::remove_dir_all(&path);
            fs::create_dir_all(&path).unwrap();
            Self(path)
        }

        fn cpu(&self, cpu: usize, max_freq: Option<u64>) {
            let dir = self.0.join(format!("cpu{cpu}/cpufreq"));
            fs::create_dir_all(&dir).unwrap();
            if let Some(freq) = max_freq {
                fs::write(dir.join("cpuinfo_max_freq"), format!("{freq}\n")).unwrap();
            }
        }
    }

    impl Drop for ScratchDir {
        fn drop(&mut self) {
            let _ = fs::remove_dir_all(&self.0);
        }
    }

    #[test]
    fn slower_cores_are_efficiency_cores() {
        let freqs = [(3, 2_800_000), (0, 1_800_000), (2, 2_800_000), (1, 1_800_000)];
        assert_eq!(efficiency_cores(&freqs), [0, 1]);
    }

    #[test]
    fn homogeneous_machine_has_no_efficiency_cores() {
        assert!(efficiency_cores(&[(0, 2_000_000), (1, 2_000_000)]).is_empty());
        assert!(efficiency_cores(&[]).is_empty());
    }

    #[test]
    fn reads_frequencies_from_sysfs_layout() {
        let dir = ScratchDir::new("sysfs");
        dir.cpu(0, Some(1_700_000));
        dir.cpu(1, Some(3_000_000));
        dir.cpu(2, None);
        fs::create_dir_all(dir.0.join("cpufreq")).unwrap();
        fs::create_dir_all(dir.0.join("cpuidle")).unwrap();

        let mut freqs = read_max_frequencies(&dir.0);
        freqs.sort_unstable();
        assert_eq!(freqs, [(0, 1_700_000), (1, 3_000_000)]);
    }

    #[test]
    fn missing_root_reads_nothing() {
        assert!(read_max_frequencies(Path::new("/nonexistent/metronome/cpu")).is_empty());
    }

    #[test]
    fn disabled_affinity_leaves_thread_alone() {
        let settings = Settings::new();
        settings.set_use_affinity(false);
        assert_eq!(pin_current_thread(&settings, "test"), None);
    }
}
