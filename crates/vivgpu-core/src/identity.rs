//! One-time hardware identification and per-revision quirk selection.

use tracing::{debug, info};

use crate::bus::RegisterBus;
use crate::regs::{
    chip_identity, hi, ChipFeatures, IdleState, MinorFeatures0, MinorFeatures1, MinorFeatures2,
    ModuleClockGating,
};

pub mod model {
    pub const GC300: u32 = 0x0300;
    pub const GC320: u32 = 0x0320;
    pub const GC400: u32 = 0x0400;
    pub const GC420: u32 = 0x0420;
    pub const GC500: u32 = 0x0500;
    pub const GC600: u32 = 0x0600;
    pub const GC700: u32 = 0x0700;
    pub const GC880: u32 = 0x0880;
    pub const GC1000: u32 = 0x1000;
    pub const GC2000: u32 = 0x2000;
    pub const GC3000: u32 = 0x3000;
    pub const GC4000: u32 = 0x4000;
    pub const GC7000: u32 = 0x7000;
}

/// What the core reported about itself, after fixups for mislabelled parts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GpuIdentity {
    pub model: u32,
    pub revision: u32,
    pub product_id: u32,
    pub customer_id: u32,
    pub eco_id: u32,
    pub features: ChipFeatures,
    pub minor_features0: MinorFeatures0,
    pub minor_features1: MinorFeatures1,
    pub minor_features2: MinorFeatures2,
    pub stream_count: u32,
    pub register_max: u32,
    pub thread_count: u32,
    pub vertex_cache_size: u32,
    pub shader_core_count: u32,
    pub pixel_pipes: u32,
    pub vertex_output_buffer_size: u32,
    /// IDLE_STATE bits that must all be set for the core to count as idle.
    pub idle_mask: IdleState,
}

impl GpuIdentity {
    pub fn probe(bus: &dyn RegisterBus) -> Self {
        let chip_identity = bus.read32(hi::CHIP_IDENTITY);
        let family =
            (chip_identity & chip_identity::FAMILY_MASK) >> chip_identity::FAMILY_SHIFT;

        let mut id = GpuIdentity {
            model: 0,
            revision: 0,
            product_id: 0,
            customer_id: 0,
            eco_id: 0,
            features: ChipFeatures::empty(),
            minor_features0: MinorFeatures0::empty(),
            minor_features1: MinorFeatures1::empty(),
            minor_features2: MinorFeatures2::empty(),
            stream_count: 0,
            register_max: 0,
            thread_count: 0,
            vertex_cache_size: 0,
            shader_core_count: 0,
            pixel_pipes: 0,
            vertex_output_buffer_size: 0,
            idle_mask: IdleState::empty(),
        };

        if family == 0x01 {
            // Legacy cores only have the identity register.
            id.model = model::GC500;
            id.revision =
                (chip_identity & chip_identity::REVISION_MASK) >> chip_identity::REVISION_SHIFT;
        } else {
            let chip_date = bus.read32(hi::CHIP_DATE);
            id.model = bus.read32(hi::CHIP_MODEL);
            id.revision = bus.read32(hi::CHIP_REV);
            id.customer_id = bus.read32(hi::CHIP_CUSTOMER_ID);

            // GC600 rev 0x19 faults on these reads.
            if !id.is(model::GC600, 0x19) {
                id.product_id = bus.read32(hi::CHIP_PRODUCT_ID);
                id.eco_id = bus.read32(hi::CHIP_ECO_ID);
            }

            // Integrators renumber GC400-family parts; fold them back.
            if (id.model & 0xff00) == 0x0400 && id.model != model::GC420 {
                id.model &= 0x0400;
            }

            if id.is(model::GC300, 0x2201) {
                let chip_time = bus.read32(hi::CHIP_TIME);
                if chip_date == 0x2008_0814 && chip_time == 0x1205_1100 {
                    id.revision = 0x1051;
                }
            }

            // "GC2000+" is a rebranded GC3000.
            if id.is(model::GC2000, 0xffff_5450) {
                id.model = model::GC3000;
                id.revision &= 0xffff;
            }

            if id.is(model::GC1000, 0x5037) && chip_date == 0x2012_0617 {
                id.eco_id = 1;
            }
            if id.is(model::GC320, 0x5303) && chip_date == 0x2014_0511 {
                id.eco_id = 1;
            }
        }

        id.features = ChipFeatures::from_bits_retain(bus.read32(hi::CHIP_FEATURE));
        if id.model == model::GC700 {
            id.features.remove(ChipFeatures::FAST_CLEAR);
        }

        let quirks = HardwareQuirks::for_identity(&id);
        if quirks.force_pipe_2d {
            id.features.insert(ChipFeatures::PIPE_2D);
        }

        let lacks_minor_registers = (id.model == model::GC500 && id.revision < 2)
            || (id.model == model::GC300 && id.revision < 0x2000);
        if !lacks_minor_registers {
            id.minor_features0 =
                MinorFeatures0::from_bits_retain(bus.read32(hi::CHIP_MINOR_FEATURE_0));
        }

        if id.minor_features0.contains(MinorFeatures0::MORE_MINOR_FEATURES) {
            id.minor_features1 =
                MinorFeatures1::from_bits_retain(bus.read32(hi::CHIP_MINOR_FEATURE_1));
            id.minor_features2 =
                MinorFeatures2::from_bits_retain(bus.read32(hi::CHIP_MINOR_FEATURE_2));

            let specs = bus.read32(hi::CHIP_SPECS);
            id.stream_count = specs & 0xf;
            id.register_max = 1 << ((specs >> 4) & 0xf);
            id.thread_count = 1 << ((specs >> 8) & 0xf);
            id.vertex_cache_size = (specs >> 12) & 0x1f;
            id.shader_core_count = (specs >> 20) & 0x1f;
            id.pixel_pipes = (specs >> 25) & 0x7;
            id.vertex_output_buffer_size = 1 << ((specs >> 28) & 0xf);
        }
        id.fill_spec_defaults();

        // These cores report zero for blocks that are not present.
        id.idle_mask = if id.model == model::GC600 || id.model == model::GC300 {
            IdleState::TX
                | IdleState::RA
                | IdleState::SE
                | IdleState::PA
                | IdleState::SH
                | IdleState::PE
                | IdleState::DE
                | IdleState::FE
        } else {
            IdleState::from_bits_retain(!IdleState::AXI_LP.bits())
        };

        info!(
            model = format_args!("GC{:x}", id.model),
            revision = format_args!("{:#x}", id.revision),
            features = format_args!("{:#010x}", id.features.bits()),
            "GPU identified"
        );
        id
    }

    /// Exact `(model, revision)` match.
    pub fn is(&self, model: u32, revision: u32) -> bool {
        self.model == model && self.revision == revision
    }

    pub fn has_dynamic_scaling(&self) -> bool {
        self.minor_features2
            .contains(MinorFeatures2::DYNAMIC_FREQUENCY_SCALING)
    }

    fn fill_spec_defaults(&mut self) {
        let big_core = self.model >= model::GC1000 || self.model == model::GC880;
        if self.stream_count == 0 {
            self.stream_count = if big_core { 4 } else { 1 };
        }
        if self.register_max <= 1 {
            self.register_max = 64;
        }
        if self.thread_count <= 1 {
            self.thread_count = match self.model {
                model::GC400 => 64,
                model::GC500 => 128,
                model::GC2000 => 512,
                m if m < model::GC1000 => 256,
                _ => 1024,
            };
        }
        if self.vertex_cache_size == 0 {
            self.vertex_cache_size = 8;
        }
        if self.shader_core_count == 0 {
            self.shader_core_count = if big_core { 2 } else { 1 };
        }
        if self.pixel_pipes == 0 {
            self.pixel_pipes = 1;
        }
        if self.vertex_output_buffer_size <= 1 {
            self.vertex_output_buffer_size = if self.model >= model::GC1000 { 512 } else { 256 };
        }
    }
}

/// Identity fields readable through `get_capability`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Model,
    Revision,
    ProductId,
    CustomerId,
    EcoId,
    Features,
    MinorFeatures0,
    MinorFeatures1,
    MinorFeatures2,
    StreamCount,
    RegisterMax,
    ThreadCount,
    VertexCacheSize,
    ShaderCoreCount,
    PixelPipes,
    VertexOutputBufferSize,
    IdleMask,
}

impl GpuIdentity {
    pub fn capability(&self, cap: Capability) -> u64 {
        let v = match cap {
            Capability::Model => self.model,
            Capability::Revision => self.revision,
            Capability::ProductId => self.product_id,
            Capability::CustomerId => self.customer_id,
            Capability::EcoId => self.eco_id,
            Capability::Features => self.features.bits(),
            Capability::MinorFeatures0 => self.minor_features0.bits(),
            Capability::MinorFeatures1 => self.minor_features1.bits(),
            Capability::MinorFeatures2 => self.minor_features2.bits(),
            Capability::StreamCount => self.stream_count,
            Capability::RegisterMax => self.register_max,
            Capability::ThreadCount => self.thread_count,
            Capability::VertexCacheSize => self.vertex_cache_size,
            Capability::ShaderCoreCount => self.shader_core_count,
            Capability::PixelPipes => self.pixel_pipes,
            Capability::VertexOutputBufferSize => self.vertex_output_buffer_size,
            Capability::IdleMask => self.idle_mask.bits(),
        };
        u64::from(v)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Quirk {
    /// Extra module clock-gating disables for this part.
    GatingDisable(ModuleClockGating),
    /// The part has a 2D pipe but does not report it.
    ForcePipe2d,
}

#[derive(Debug, Clone, Copy)]
struct QuirkEntry {
    model: u32,
    /// `None` matches when `max_revision` does.
    revision: Option<u32>,
    max_revision: Option<u32>,
    quirk: Quirk,
}

impl QuirkEntry {
    const fn exact(model: u32, revision: u32, quirk: Quirk) -> Self {
        Self {
            model,
            revision: Some(revision),
            max_revision: None,
            quirk,
        }
    }

    const fn up_to(model: u32, max_revision: Option<u32>, quirk: Quirk) -> Self {
        Self {
            model,
            revision: None,
            max_revision,
            quirk,
        }
    }

    fn matches(&self, id: &GpuIdentity) -> bool {
        if self.model != id.model {
            return false;
        }
        match (self.revision, self.max_revision) {
            (Some(rev), _) => rev == id.revision,
            (None, Some(max)) => id.revision <= max,
            (None, None) => true,
        }
    }
}

const QUIRK_TABLE: &[QuirkEntry] = &[
    QuirkEntry::exact(
        model::GC4000,
        0x5222,
        Quirk::GatingDisable(ModuleClockGating::DISABLE_TX),
    ),
    QuirkEntry::exact(
        model::GC2000,
        0x5108,
        Quirk::GatingDisable(ModuleClockGating::DISABLE_TX),
    ),
    QuirkEntry::exact(
        model::GC7000,
        0x6202,
        Quirk::GatingDisable(
            ModuleClockGating::DISABLE_TX
                .union(ModuleClockGating::DISABLE_SE)
                .union(ModuleClockGating::DISABLE_RA),
        ),
    ),
    QuirkEntry::exact(
        model::GC7000,
        0x6203,
        Quirk::GatingDisable(ModuleClockGating::DISABLE_TX),
    ),
    QuirkEntry::up_to(model::GC500, Some(2), Quirk::ForcePipe2d),
    QuirkEntry::up_to(model::GC300, None, Quirk::ForcePipe2d),
];

/// Per-revision behaviour selected once at identification time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HardwareQuirks {
    /// Bits ORed into `PM_MODULE_CONTROLS` after every reset.
    pub gating_disable: ModuleClockGating,
    pub force_pipe_2d: bool,
}

impl HardwareQuirks {
    pub fn for_identity(id: &GpuIdentity) -> Self {
        let mut quirks = HardwareQuirks::default();
        for entry in QUIRK_TABLE.iter().filter(|e| e.matches(id)) {
            match entry.quirk {
                Quirk::GatingDisable(bits) => quirks.gating_disable |= bits,
                Quirk::ForcePipe2d => quirks.force_pipe_2d = true,
            }
        }

        // Revision-range rules that apply across models.
        if id.revision < 0x5000
            && id.minor_features0.contains(MinorFeatures0::HZ)
            && !id
                .minor_features1
                .contains(MinorFeatures1::DISABLE_PE_GATING)
        {
            quirks.gating_disable |= ModuleClockGating::DISABLE_PE;
        }
        if id.revision < 0x5422 {
            quirks.gating_disable |= ModuleClockGating::UNKNOWN_15;
        }
        quirks.gating_disable |= ModuleClockGating::DISABLE_RA_HZ | ModuleClockGating::DISABLE_RA_EZ;

        debug!(
            gating_disable = format_args!("{:#x}", quirks.gating_disable.bits()),
            force_pipe_2d = quirks.force_pipe_2d,
            "hardware quirks selected"
        );
        quirks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ChipPreset, SimulatedGpu};
    use pretty_assertions::assert_eq;

    #[test]
    fn legacy_family_reports_gc500() {
        let gpu = SimulatedGpu::new(ChipPreset {
            identity: 0x0100_2000,
            ..ChipPreset::gc2000()
        });
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.model, model::GC500);
        assert_eq!(id.revision, 2);
        assert!(id.features.contains(ChipFeatures::PIPE_2D));
    }

    #[test]
    fn gc400_family_is_normalized() {
        let gpu = SimulatedGpu::new(ChipPreset {
            model: 0x0428,
            ..ChipPreset::gc2000()
        });
        assert_eq!(GpuIdentity::probe(&gpu).model, model::GC400);

        let gpu = SimulatedGpu::new(ChipPreset {
            model: model::GC420,
            ..ChipPreset::gc2000()
        });
        assert_eq!(GpuIdentity::probe(&gpu).model, model::GC420);
    }

    #[test]
    fn gc2000_plus_is_rebranded_gc3000() {
        let gpu = SimulatedGpu::new(ChipPreset {
            revision: 0xffff_5450,
            ..ChipPreset::gc2000()
        });
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.model, model::GC3000);
        assert_eq!(id.revision, 0x5450);
    }

    #[test]
    fn gc300_eco_revision_fixup() {
        let gpu = SimulatedGpu::new(ChipPreset {
            model: model::GC300,
            revision: 0x2201,
            date: 0x2008_0814,
            time: 0x1205_1100,
            ..ChipPreset::gc2000()
        });
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.revision, 0x1051);
        // rev < 0x2000 has no minor feature registers
        assert_eq!(id.minor_features0, MinorFeatures0::empty());
        assert!(id.features.contains(ChipFeatures::PIPE_2D));
        assert!(!id.idle_mask.contains(IdleState::VG));
        assert!(id.idle_mask.contains(IdleState::FE));
    }

    #[test]
    fn specs_are_decoded() {
        let gpu = SimulatedGpu::new(ChipPreset::gc2000());
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.stream_count, 4);
        assert_eq!(id.register_max, 64);
        assert_eq!(id.thread_count, 1024);
        assert_eq!(id.shader_core_count, 4);
        assert_eq!(id.pixel_pipes, 1);
        assert_eq!(id.vertex_output_buffer_size, 512);
        assert_eq!(id.idle_mask.bits(), 0x7fff_ffff);
    }

    #[test]
    fn spec_defaults_fill_missing_fields() {
        let gpu = SimulatedGpu::new(ChipPreset {
            specs: 0,
            ..ChipPreset::gc2000()
        });
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.stream_count, 4);
        assert_eq!(id.thread_count, 512);
        assert_eq!(id.shader_core_count, 2);
        assert_eq!(id.vertex_cache_size, 8);
    }

    #[test]
    fn quirk_table_selects_by_model_and_revision() {
        let gpu = SimulatedGpu::new(ChipPreset::gc7000_6202());
        let quirks = HardwareQuirks::for_identity(&GpuIdentity::probe(&gpu));
        assert_eq!(
            quirks.gating_disable,
            ModuleClockGating::DISABLE_TX
                | ModuleClockGating::DISABLE_SE
                | ModuleClockGating::DISABLE_RA
                | ModuleClockGating::DISABLE_RA_HZ
                | ModuleClockGating::DISABLE_RA_EZ
        );

        let gpu = SimulatedGpu::new(ChipPreset::gc2000());
        let quirks = HardwareQuirks::for_identity(&GpuIdentity::probe(&gpu));
        assert_eq!(
            quirks.gating_disable,
            ModuleClockGating::DISABLE_TX
                | ModuleClockGating::UNKNOWN_15
                | ModuleClockGating::DISABLE_RA_HZ
                | ModuleClockGating::DISABLE_RA_EZ
        );
    }

    #[test]
    fn capability_query_is_read_only_view() {
        let gpu = SimulatedGpu::new(ChipPreset::gc2000());
        let id = GpuIdentity::probe(&gpu);
        assert_eq!(id.capability(Capability::Model), 0x2000);
        assert_eq!(id.capability(Capability::Revision), 0x5108);
        assert_eq!(
            id.capability(Capability::Features) as u32,
            id.features.bits()
        );
    }
}
