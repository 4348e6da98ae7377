// Copyright 2026 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Boot-time configuration of the hypervisor.

use std::fs;
use std::path::Path;

use anyhow::bail;
use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

use crate::mem::PAGE_SHIFT;
use crate::traps::HostCaps;

/// Bits resolved by one level of stage-2 translation with 4KiB pages.
const BITS_PER_LEVEL: u32 = PAGE_SHIFT as u32 - 3;

/// Largest number of tables concatenated at the stage-2 start level.
const MAX_CONCAT_BITS: u32 = 4;

/// SVE vector lengths are multiples of 128 bits.
const SVE_VQ_BYTES: u32 = 16;

fn default_nr_cpus() -> usize {
    8
}

fn default_max_vms() -> usize {
    255
}

fn default_handle_offset() -> u32 {
    0x1000
}

fn default_ipa_bits() -> u32 {
    40
}

fn default_sve_max_vl() -> u32 {
    256
}

fn default_true() -> bool {
    true
}

fn default_hyp_req_capacity() -> usize {
    16
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct HypConfig {
    /// Number of physical cores that may enter the hypervisor.
    #[serde(default = "default_nr_cpus")]
    pub nr_cpus: usize,
    /// Capacity of the VM table.
    #[serde(default = "default_max_vms")]
    pub max_vms: usize,
    /// Added to a VM table slot index to form its handle. Must be non-zero.
    #[serde(default = "default_handle_offset")]
    pub handle_offset: u32,
    /// Guest physical address width of every stage-2.
    #[serde(default = "default_ipa_bits")]
    pub ipa_bits: u32,
    #[serde(default)]
    pub host_caps: HostCaps,
    /// Largest SVE vector length, in bytes, the hypervisor can context switch.
    #[serde(default = "default_sve_max_vl")]
    pub sve_max_vl: u32,
    /// Largest SVE vector length, in bytes, implemented by the host CPUs.
    #[serde(default = "default_sve_max_vl")]
    pub host_sve_max_vl: u32,
    /// Whether protected VMs may be given a PMUv3.
    #[serde(default)]
    pub pvm_allow_pmu: bool,
    #[serde(default = "default_true")]
    pub pvm_allow_ptrauth: bool,
    #[serde(default = "default_true")]
    pub pvm_allow_sve: bool,
    /// Slots in each vCPU's host request ring, including the terminator.
    #[serde(default = "default_hyp_req_capacity")]
    pub hyp_req_capacity: usize,
    /// Whether the secure monitor implements the TRNG interface.
    #[serde(default)]
    pub trng_available: bool,
}

impl Default for HypConfig {
    fn default() -> Self {
        HypConfig {
            nr_cpus: default_nr_cpus(),
            max_vms: default_max_vms(),
            handle_offset: default_handle_offset(),
            ipa_bits: default_ipa_bits(),
            host_caps: HostCaps::empty(),
            sve_max_vl: default_sve_max_vl(),
            host_sve_max_vl: default_sve_max_vl(),
            pvm_allow_pmu: false,
            pvm_allow_ptrauth: true,
            pvm_allow_sve: true,
            hyp_req_capacity: default_hyp_req_capacity(),
            trng_available: false,
        }
    }
}

impl HypConfig {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        let cfg: HypConfig =
            serde_json::from_str(json).context("failed to parse hypervisor configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::from_json(&json)
            .with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.nr_cpus == 0 {
            bail!("nr-cpus must be at least 1");
        }
        if self.max_vms == 0 {
            bail!("max-vms must be at least 1");
        }
        if self.handle_offset == 0 {
            bail!("handle-offset must be non-zero");
        }
        let last_slot = u32::try_from(self.max_vms - 1).context("max-vms is too large")?;
        if self.handle_offset.checked_add(last_slot).is_none() {
            bail!(
                "handle-offset {:#x} with {} VMs overflows the handle space",
                self.handle_offset,
                self.max_vms
            );
        }
        if !(32..=52).contains(&self.ipa_bits) {
            bail!("ipa-bits {} is outside 32..=52", self.ipa_bits);
        }
        if self.hyp_req_capacity < 2 {
            bail!("hyp-req-capacity must leave room for one request and the terminator");
        }
        if self.sve_max_vl % SVE_VQ_BYTES != 0 || self.host_sve_max_vl % SVE_VQ_BYTES != 0 {
            bail!("SVE vector lengths must be multiples of {} bytes", SVE_VQ_BYTES);
        }
        Ok(())
    }

    /// Translation levels walked by every guest stage-2, after start-level concatenation.
    pub fn stage2_levels(&self) -> u32 {
        self.stage2_geometry().0
    }

    /// First guest physical address beyond the stage-2 input range.
    pub fn ipa_limit(&self) -> u64 {
        1 << self.ipa_bits
    }

    /// Size in bytes of the stage-2 root the host donates for each VM.
    pub fn stage2_pgd_size(&self) -> u64 {
        self.stage2_geometry().1 << PAGE_SHIFT
    }

    /// Pages a vCPU memcache must hold to map any single page into its stage-2.
    pub fn mmu_cache_min_pages(&self) -> u64 {
        self.stage2_levels().saturating_sub(1) as u64
    }

    fn stage2_geometry(&self) -> (u32, u64) {
        let va_bits = self.ipa_bits.saturating_sub(PAGE_SHIFT as u32);
        let levels = (va_bits + BITS_PER_LEVEL - 1) / BITS_PER_LEVEL;
        let top_bits = va_bits - BITS_PER_LEVEL * levels.saturating_sub(1);
        if levels > 1 && top_bits <= MAX_CONCAT_BITS {
            (levels - 1, 1 << top_bits)
        } else {
            (levels, 1)
        }
    }
}
