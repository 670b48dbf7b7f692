// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use std::path::Path;

pub const DEVICES_CGROUP: &str = "/sys/fs/cgroup/devices";

/// Widen device access for a privileged container. Runtimes that do not
/// mount the devices controller already run the container unconfined, so a
/// missing directory is not an error.
pub fn allow_all_devices() -> std::io::Result<()> {
    allow_all_devices_at(Path::new(DEVICES_CGROUP))
}

pub fn allow_all_devices_at(devices_cgroup: &Path) -> std::io::Result<()> {
    if !devices_cgroup.is_dir() {
        return Ok(());
    }
    std::fs::write(devices_cgroup.join("devices.allow"), b"a *:* rwm")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_controller_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("devices");
        allow_all_devices_at(&absent).unwrap();
        assert!(!absent.exists());
    }

    #[test]
    fn widens_device_access() {
        let dir = tempfile::tempdir().unwrap();
        allow_all_devices_at(dir.path()).unwrap();
        let written = std::fs::read(dir.path().join("devices.allow")).unwrap();
        assert_eq!(written, b"a *:* rwm");
    }
}
