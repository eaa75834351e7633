//! Mock SMI backend
//!
//! Stands in for the vendor management library: a fixed population of
//! devices with MI-class inventory data, lightly wiggling counters, full
//! update validation, and an event injection queue so tests and the debug
//! RPC can drive the event pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;

use tracing::debug;
use vigil_error::{ErrorCode, SmiError, SmiResult};

use crate::attrs::{AttrValue, WatchAttrId};
use crate::events::{EventId, RawEvent, MAX_EVENT_STR};
use crate::types::*;
use crate::MAX_GPU;

/// Default device count when none is requested
pub const MOCK_DEFAULT_NUM_GPU: u32 = 4;

/// Hardware unique ids of the mock devices
const MOCK_UNIQUE_ID: [u64; MAX_GPU] = [
    0x82d0655d514f2a30,
    0xb0a8e71cda21053d,
    0xf995d85297ccd9dc,
    0x68cccfa2b07a7844,
    0x5c7d5bf36c641653,
    0x66a63cfe0171bbf6,
    0x2ec4a124a4fbcc4e,
    0x77e5e048b6a83187,
    0xf09b845d31ae3857,
    0x3157ecb6077a5d44,
    0x4c084d1f803abfe4,
    0xfca7aec17c68886b,
    0x75da07dd38df86d0,
    0x3d8f866be4a9c06f,
    0xc2ba04903dff37d3,
    0x6971c8479bd8510f,
];

// supported frequency bounds per updatable clock domain (MHz)
const SCLK_MIN: u32 = 500;
const SCLK_MAX: u32 = 1700;
const MCLK_MIN: u32 = 400;
const MCLK_MAX: u32 = 1600;

/// maximum number of clock frequency ranges accepted in one update
const MAX_CLOCK_FREQ_RANGES: usize = 4;

/// overdrive bounds (percent)
const OVERDRIVE_MAX: u32 = 20;

/// power cap bounds (Watts)
const POWER_CAP_MIN: u64 = 300;
const POWER_CAP_MAX: u64 = 560;

pub struct MockSmi {
    num_gpus: u32,
    /// when set, every poll also fabricates one round-robin event
    auto_events: bool,
    injected: Mutex<VecDeque<RawEvent>>,
    round_robin: Mutex<u32>,
    lcg: Mutex<u64>,
}

impl MockSmi {
    pub fn new(num_gpus: u32) -> Self {
        let num_gpus = num_gpus.clamp(1, MAX_GPU as u32);
        Self {
            num_gpus,
            auto_events: false,
            injected: Mutex::new(VecDeque::new()),
            round_robin: Mutex::new(0),
            lcg: Mutex::new(0x5eed_1157_ba5e_c0de),
        }
    }

    /// Fabricate one synthetic event per poll, cycling device and event id
    pub fn with_auto_events(mut self) -> Self {
        self.auto_events = true;
        self
    }

    pub fn num_gpus(&self) -> u32 {
        self.num_gpus
    }

    /// Queue a raw event for the next poll
    pub fn inject_event(&self, handle: GpuHandle, id: EventId, message: &str) {
        let mut message = message.to_string();
        if message.len() > MAX_EVENT_STR {
            let mut cut = MAX_EVENT_STR;
            while !message.is_char_boundary(cut) {
                cut -= 1;
            }
            message.truncate(cut);
        }
        self.injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(RawEvent {
                handle,
                id,
                message,
            });
    }

    fn jitter(&self, range: u64) -> u64 {
        if range == 0 {
            return 0;
        }
        let mut state = self.lcg.lock().unwrap_or_else(|e| e.into_inner());
        *state = state
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        (*state >> 33) % range
    }

    fn check_handle(&self, handle: GpuHandle) -> SmiResult<u32> {
        let idx = handle.0 as u32;
        if handle.0 >= self.num_gpus as u64 {
            return Err(SmiError::unknown(format!("unknown GPU handle {}", handle.0)));
        }
        Ok(idx)
    }

    fn validate_clock_ranges(&self, ranges: &[ClockFreqRange]) -> SmiResult<()> {
        if ranges.len() > MAX_CLOCK_FREQ_RANGES {
            return Err(SmiError::new(
                ErrorCode::NumClockFreqRangeExceeded,
                format!("{} clock frequency ranges requested", ranges.len()),
            ));
        }
        let mut seen: Vec<ClockType> = Vec::new();
        for r in ranges {
            if seen.contains(&r.clock_type) {
                return Err(SmiError::new(
                    ErrorCode::DuplicateClockFreqRange,
                    format!("duplicate range for clock {}", r.clock_type),
                ));
            }
            seen.push(r.clock_type);
            let (min, max) = match r.clock_type {
                ClockType::System => (SCLK_MIN, SCLK_MAX),
                ClockType::Memory => (MCLK_MIN, MCLK_MAX),
                ClockType::Video | ClockType::Data => {
                    return Err(SmiError::new(
                        ErrorCode::ClockTypeFreqRangeUpdateNotSupported,
                        format!("clock {} frequency range is not updatable", r.clock_type),
                    ));
                }
            };
            if r.lo >= r.hi || r.lo < min || r.hi > max {
                return Err(SmiError::new(
                    ErrorCode::ClockFreqRangeInvalid,
                    format!(
                        "clock {} range {}-{} outside supported {}-{}",
                        r.clock_type, r.lo, r.hi, min, max
                    ),
                ));
            }
        }
        Ok(())
    }
}

impl crate::SmiBackend for MockSmi {
    fn discover(&self) -> SmiResult<Vec<DiscoveredGpu>> {
        let gpus = (0..self.num_gpus)
            .map(|i| DiscoveredGpu {
                handle: GpuHandle(i as u64),
                unique_id: MOCK_UNIQUE_ID[i as usize],
            })
            .collect();
        Ok(gpus)
    }

    fn fill_spec(&self, handle: GpuHandle) -> SmiResult<GpuSpec> {
        self.check_handle(handle)?;
        Ok(GpuSpec {
            overdrive_level: 0,
            perf_level: PerfLevel::Auto,
            clock_freq: vec![
                ClockFreqRange {
                    clock_type: ClockType::System,
                    lo: SCLK_MIN,
                    hi: SCLK_MAX,
                },
                ClockFreqRange {
                    clock_type: ClockType::Memory,
                    lo: MCLK_MIN,
                    hi: MCLK_MAX,
                },
                ClockFreqRange {
                    clock_type: ClockType::Video,
                    lo: 914,
                    hi: 1333,
                },
                ClockFreqRange {
                    clock_type: ClockType::Data,
                    lo: 711,
                    hi: 1143,
                },
            ],
            power_cap: 550,
            compute_partition_type: ComputePartitionType::Spx,
        })
    }

    fn fill_status(&self, handle: GpuHandle, gpu_id: u32) -> SmiResult<GpuStatus> {
        self.check_handle(handle)?;
        let mut clock_status = Vec::new();
        for i in 0..8u32 {
            let frequency = 138 + i;
            clock_status.push(ClockStatus {
                clock_type: ClockType::System,
                frequency,
                locked: i % 2 == 1,
                deep_sleep: frequency <= 140,
            });
        }
        clock_status.push(ClockStatus {
            clock_type: ClockType::Memory,
            frequency: 900,
            locked: false,
            deep_sleep: false,
        });
        clock_status.push(ClockStatus {
            clock_type: ClockType::Video,
            frequency: 29,
            locked: false,
            deep_sleep: true,
        });
        clock_status.push(ClockStatus {
            clock_type: ClockType::Data,
            frequency: 22,
            locked: false,
            deep_sleep: true,
        });
        Ok(GpuStatus {
            index: gpu_id,
            serial_num: format!("PCB046982-{:04}", 71 + gpu_id),
            card_series: "AMD INSTINCT MI200 (MCM) OAM AC MBA".to_string(),
            card_model: "0x0b0c".to_string(),
            card_vendor: "Advanced Micro Devices, Inc. [AMD/ATI]".to_string(),
            card_sku: "D65205".to_string(),
            driver_version: "6.3.6".to_string(),
            vbios_part_number: "113-D65205-107".to_string(),
            vbios_version: "022.040.003.041.000001".to_string(),
            firmware: vec![
                FwVersion {
                    firmware: "MEC2".to_string(),
                    version: "78".to_string(),
                },
                FwVersion {
                    firmware: "RLC".to_string(),
                    version: "17".to_string(),
                },
                FwVersion {
                    firmware: "SDMA2".to_string(),
                    version: "8".to_string(),
                },
                FwVersion {
                    firmware: "TA_RAS".to_string(),
                    version: "27.00.01.60".to_string(),
                },
                FwVersion {
                    firmware: "TA_XGMI".to_string(),
                    version: "32.00.00.19".to_string(),
                },
                FwVersion {
                    firmware: "VCN".to_string(),
                    version: "0x0110101b".to_string(),
                },
            ],
            memory_vendor: "hynix".to_string(),
            clock_status,
            pcie_status: PcieStatus {
                pcie_bus_id: format!("0000:{:02x}:00.0", 0x59 + gpu_id),
                slot_type: PcieSlotType::Oam,
                width: 16,
                max_width: 16,
                speed: 16,
                max_speed: 32,
                bandwidth: 315,
            },
            vram_status: VramStatus {
                vram_type: VramType::Hbm,
                vendor: VramVendor::Hynix,
                size: 196592,
            },
            xgmi_status: XgmiStatus {
                error_status: XgmiErrorStatus::NoError,
            },
            partition_id: 0,
        })
    }

    fn fill_stats(&self, handle: GpuHandle) -> SmiResult<GpuStats> {
        self.check_handle(handle)?;
        let total_vram = 196592;
        let used_vram = 1273 + self.jitter(64);
        let total_gtt = 128716;
        let used_gtt = 20 + self.jitter(8);
        Ok(GpuStats {
            avg_package_power: 90 + self.jitter(40),
            package_power: 90 + self.jitter(60),
            usage: GpuUsage {
                gfx_activity: 21282136 + self.jitter(90),
                umc_activity: 1806 + self.jitter(90),
                mm_activity: self.jitter(10),
            },
            vram_usage: VramUsage {
                total_vram,
                used_vram,
                free_vram: total_vram - used_vram,
                total_visible_vram: total_vram,
                used_visible_vram: used_vram,
                free_visible_vram: total_vram - used_vram,
                total_gtt,
                used_gtt,
                free_gtt: total_gtt - used_gtt,
            },
            energy_consumed: 25293978861568 + self.jitter(90),
        })
    }

    fn reset(&self, handle: GpuHandle, reset_type: ResetType) -> SmiResult<()> {
        self.check_handle(handle)?;
        debug!("mock reset of GPU {} ({:?})", handle.0, reset_type);
        Ok(())
    }

    fn update(&self, handle: GpuHandle, spec: &GpuSpec, mask: u64) -> SmiResult<()> {
        self.check_handle(handle)?;
        if mask & upd::OVERDRIVE != 0 && spec.overdrive_level > OVERDRIVE_MAX {
            return Err(SmiError::new(
                ErrorCode::OverdriveOutOfRange,
                format!(
                    "overdrive {} exceeds maximum {}",
                    spec.overdrive_level, OVERDRIVE_MAX
                ),
            ));
        }
        if mask & upd::CLOCK_FREQ != 0 {
            self.validate_clock_ranges(&spec.clock_freq)?;
        }
        if mask & upd::POWER_CAP != 0
            && (spec.power_cap < POWER_CAP_MIN || spec.power_cap > POWER_CAP_MAX)
        {
            return Err(SmiError::new(
                ErrorCode::GpuPowerCapOutOfRange,
                format!(
                    "power cap {} outside supported {}-{} W",
                    spec.power_cap, POWER_CAP_MIN, POWER_CAP_MAX
                ),
            ));
        }
        debug!("mock update of GPU {} mask {:#x}", handle.0, mask);
        Ok(())
    }

    fn fill_topology(&self, handle: GpuHandle) -> SmiResult<DeviceTopology> {
        let idx = self.check_handle(handle)?;
        let mut peers = Vec::new();
        for i in 0..self.num_gpus {
            if i == idx {
                continue;
            }
            peers.push(PeerTopology {
                peer: format!("GPU{}", i),
                device_type: DeviceType::Gpu,
                num_hops: 1,
                link_type: IoLinkType::Xgmi,
                link_weight: 15 + (15 * ((i + idx) as u64 % 5)),
            });
        }
        Ok(DeviceTopology {
            device: format!("GPU{}", idx),
            peers,
        })
    }

    fn partition_id(&self, handle: GpuHandle) -> SmiResult<u32> {
        self.check_handle(handle)?;
        Ok(0)
    }

    fn bad_pages(&self, handle: GpuHandle) -> SmiResult<Vec<BadPageRecord>> {
        self.check_handle(handle)?;
        Ok(vec![BadPageRecord {
            page_address: 0x5c70ec,
            page_size: 4096,
            page_status: PageStatus::Unreservable,
        }])
    }

    fn event_poll(&self) -> Vec<RawEvent> {
        let mut batch: Vec<RawEvent> = self
            .injected
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        if self.auto_events {
            let mut rr = self.round_robin.lock().unwrap_or_else(|e| e.into_inner());
            let id = match *rr % 4 {
                0 => EventId::GpuPostReset,
                1 => EventId::GpuPreReset,
                2 => EventId::ThermalThrottle,
                _ => EventId::VmPageFault,
            };
            batch.push(RawEvent {
                handle: GpuHandle((*rr % self.num_gpus) as u64),
                id,
                message: "test event".to_string(),
            });
            *rr = rr.wrapping_add(1);
        }
        batch
    }

    fn attr_read(&self, handle: GpuHandle, attr: WatchAttrId) -> SmiResult<AttrValue> {
        use WatchAttrId::*;
        self.check_handle(handle)?;
        let value = match attr {
            GpuClock => AttrValue::Long(1600 + self.jitter(100)),
            MemClock => AttrValue::Long(1550 + self.jitter(50)),
            MemoryTemp => AttrValue::Long(44 + self.jitter(8)),
            GpuTemp => AttrValue::Long(50 + self.jitter(12)),
            PowerUsage => AttrValue::Float(90.0 + self.jitter(200) as f32 / 10.0),
            PcieTx | PcieRx => AttrValue::Long(2048 + self.jitter(512)),
            GpuUtil => AttrValue::Long(self.jitter(100)),
            GpuMemoryUsage => AttrValue::Long(1273 + self.jitter(64)),
            PcieBandwidth => AttrValue::Long(315),
            XgmiNbr0TxThrput | XgmiNbr1TxThrput | XgmiNbr2TxThrput | XgmiNbr3TxThrput
            | XgmiNbr4TxThrput | XgmiNbr5TxThrput => {
                AttrValue::Long(1_500_000 + self.jitter(250_000))
            }
            XgmiNbr0NopTx | XgmiNbr0ReqTx | XgmiNbr0RespTx | XgmiNbr0BeatsTx | XgmiNbr1NopTx
            | XgmiNbr1ReqTx | XgmiNbr1RespTx | XgmiNbr1BeatsTx => {
                AttrValue::Long(21282136 + self.jitter(4096))
            }
            // ECC error counters stay small and only ever grow in tests' eyes
            _ => AttrValue::Long(self.jitter(3)),
        };
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SmiBackend;

    #[test]
    fn discover_reports_requested_population() {
        let smi = MockSmi::new(4);
        let gpus = smi.discover().unwrap();
        assert_eq!(gpus.len(), 4);
        assert_eq!(gpus[0].unique_id, MOCK_UNIQUE_ID[0]);
        assert_eq!(gpus[3].handle, GpuHandle(3));
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let smi = MockSmi::new(2);
        assert!(smi.fill_spec(GpuHandle(5)).is_err());
    }

    #[test]
    fn update_rejects_excess_overdrive() {
        let smi = MockSmi::new(1);
        let spec = GpuSpec {
            overdrive_level: 30,
            ..Default::default()
        };
        let err = smi.update(GpuHandle(0), &spec, upd::OVERDRIVE).unwrap_err();
        assert_eq!(err.code, ErrorCode::OverdriveOutOfRange);
    }

    #[test]
    fn update_rejects_bad_clock_ranges() {
        let smi = MockSmi::new(1);
        let range = |ct, lo, hi| ClockFreqRange {
            clock_type: ct,
            lo,
            hi,
        };

        let mut spec = GpuSpec::default();
        spec.clock_freq = vec![range(ClockType::System, 1600, 900)];
        let err = smi.update(GpuHandle(0), &spec, upd::CLOCK_FREQ).unwrap_err();
        assert_eq!(err.code, ErrorCode::ClockFreqRangeInvalid);

        spec.clock_freq = vec![
            range(ClockType::System, 600, 900),
            range(ClockType::System, 700, 1000),
        ];
        let err = smi.update(GpuHandle(0), &spec, upd::CLOCK_FREQ).unwrap_err();
        assert_eq!(err.code, ErrorCode::DuplicateClockFreqRange);

        spec.clock_freq = vec![range(ClockType::Video, 914, 1000)];
        let err = smi.update(GpuHandle(0), &spec, upd::CLOCK_FREQ).unwrap_err();
        assert_eq!(err.code, ErrorCode::ClockTypeFreqRangeUpdateNotSupported);

        spec.clock_freq = vec![
            range(ClockType::System, 600, 900),
            range(ClockType::Memory, 500, 800),
            range(ClockType::System, 700, 1000),
            range(ClockType::Memory, 600, 900),
            range(ClockType::System, 800, 1100),
        ];
        let err = smi.update(GpuHandle(0), &spec, upd::CLOCK_FREQ).unwrap_err();
        assert_eq!(err.code, ErrorCode::NumClockFreqRangeExceeded);
    }

    #[test]
    fn update_rejects_power_cap_outside_bounds() {
        let smi = MockSmi::new(1);
        let spec = GpuSpec {
            power_cap: 100,
            ..Default::default()
        };
        let err = smi.update(GpuHandle(0), &spec, upd::POWER_CAP).unwrap_err();
        assert_eq!(err.code, ErrorCode::GpuPowerCapOutOfRange);

        let spec = GpuSpec {
            power_cap: 500,
            ..Default::default()
        };
        assert!(smi.update(GpuHandle(0), &spec, upd::POWER_CAP).is_ok());
    }

    #[test]
    fn injected_events_drain_in_order() {
        let smi = MockSmi::new(2);
        smi.inject_event(GpuHandle(0), EventId::ThermalThrottle, "hot");
        smi.inject_event(GpuHandle(1), EventId::RingHang, "stuck");
        let batch = smi.event_poll();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].id, EventId::ThermalThrottle);
        assert_eq!(batch[1].handle, GpuHandle(1));
        assert!(smi.event_poll().is_empty());
    }

    #[test]
    fn auto_events_cycle_devices() {
        let smi = MockSmi::new(2).with_auto_events();
        let a = smi.event_poll();
        let b = smi.event_poll();
        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
        assert_ne!(a[0].handle, b[0].handle);
    }

    #[test]
    fn attr_read_types_match_declaration() {
        let smi = MockSmi::new(1);
        let v = smi.attr_read(GpuHandle(0), WatchAttrId::PowerUsage).unwrap();
        assert_eq!(v.value_type(), WatchAttrId::PowerUsage.value_type());
        let v = smi.attr_read(GpuHandle(0), WatchAttrId::GpuClock).unwrap();
        assert_eq!(v.value_type(), WatchAttrId::GpuClock.value_type());
    }

    #[test]
    fn topology_links_every_other_gpu() {
        let smi = MockSmi::new(4);
        let topo = smi.fill_topology(GpuHandle(1)).unwrap();
        assert_eq!(topo.device, "GPU1");
        assert_eq!(topo.peers.len(), 3);
        assert!(topo.peers.iter().all(|p| p.num_hops == 1));
        assert!(topo.peers.iter().all(|p| p.peer != "GPU1"));
    }
}
