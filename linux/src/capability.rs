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

use ::caps::errors::CapsError;
use ::caps::{CapSet, Capability, CapsHashSet};

/// Capabilities a non-privileged container must not keep. These allow the
/// contained workload to reconfigure the host, load code into the kernel, or
/// escape resource accounting.
pub const DROPPED_CAPABILITIES: [Capability; 14] = [
    Capability::CAP_SETPCAP,
    Capability::CAP_SYS_MODULE,
    Capability::CAP_SYS_RAWIO,
    Capability::CAP_SYS_PACCT,
    Capability::CAP_SYS_ADMIN,
    Capability::CAP_SYS_NICE,
    Capability::CAP_SYS_RESOURCE,
    Capability::CAP_SYS_TIME,
    Capability::CAP_SYS_TTY_CONFIG,
    Capability::CAP_MKNOD,
    Capability::CAP_AUDIT_WRITE,
    Capability::CAP_AUDIT_CONTROL,
    Capability::CAP_MAC_OVERRIDE,
    Capability::CAP_MAC_ADMIN,
];

/// Remove [`DROPPED_CAPABILITIES`] from this process. The bounding set goes
/// first: pruning it requires CAP_SETPCAP, which is itself on the list.
/// Effective shrinks before permitted so the subset rule holds throughout.
pub fn drop_dangerous() -> Result<(), CapsError> {
    for cap in DROPPED_CAPABILITIES {
        if ::caps::has_cap(None, CapSet::Bounding, cap)? {
            ::caps::drop(None, CapSet::Bounding, cap)?;
        }
    }
    for set in [CapSet::Effective, CapSet::Permitted, CapSet::Inheritable] {
        let mut held = ::caps::read(None, set)?;
        let before = held.len();
        for cap in DROPPED_CAPABILITIES {
            held.remove(&cap);
        }
        if held.len() != before {
            ::caps::set(None, set, &held)?;
        }
    }
    Ok(())
}

/// Current effective set, for verification after [`drop_dangerous`].
pub fn effective() -> Result<CapsHashSet, CapsError> {
    ::caps::read(None, CapSet::Effective)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drop_list_matches_runtime_contract() {
        assert_eq!(DROPPED_CAPABILITIES.len(), 14);
        for cap in [
            Capability::CAP_SYS_ADMIN,
            Capability::CAP_SYS_MODULE,
            Capability::CAP_MKNOD,
            Capability::CAP_SETPCAP,
        ] {
            assert!(DROPPED_CAPABILITIES.contains(&cap));
        }
        // the workload keeps the capabilities a service manager needs
        for cap in [
            Capability::CAP_CHOWN,
            Capability::CAP_KILL,
            Capability::CAP_NET_BIND_SERVICE,
            Capability::CAP_SETUID,
        ] {
            assert!(!DROPPED_CAPABILITIES.contains(&cap));
        }
    }
}
