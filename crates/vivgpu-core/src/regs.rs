//! MMIO register layout and bit definitions for the Vivante-style GPU core.
//!
//! Only the registers the submission, completion and reset paths touch are listed here.

use bitflags::bitflags;

pub mod hi {
    //! Host interface block.

    pub const CLOCK_CONTROL: u32 = 0x0000;
    pub const IDLE_STATE: u32 = 0x0004;
    pub const AXI_CONFIG: u32 = 0x0008;
    pub const AXI_STATUS: u32 = 0x000c;
    pub const INTR_ACKNOWLEDGE: u32 = 0x0010;
    pub const INTR_ENBL: u32 = 0x0014;
    pub const CHIP_IDENTITY: u32 = 0x0018;
    pub const CHIP_FEATURE: u32 = 0x001c;
    pub const CHIP_MODEL: u32 = 0x0020;
    pub const CHIP_REV: u32 = 0x0024;
    pub const CHIP_DATE: u32 = 0x0028;
    pub const CHIP_TIME: u32 = 0x002c;
    pub const CHIP_CUSTOMER_ID: u32 = 0x0030;
    pub const CHIP_MINOR_FEATURE_0: u32 = 0x0034;
    pub const CHIP_SPECS: u32 = 0x0048;
    pub const CHIP_MINOR_FEATURE_1: u32 = 0x0074;
    pub const CHIP_MINOR_FEATURE_2: u32 = 0x0084;
    pub const CHIP_PRODUCT_ID: u32 = 0x00a8;
    pub const CHIP_ECO_ID: u32 = 0x00e8;
}

pub mod clock_control {
    pub const CLK3D_DIS: u32 = 1 << 0;
    pub const CLK2D_DIS: u32 = 1 << 1;
    pub const FSCALE_VAL_SHIFT: u32 = 2;
    pub const FSCALE_VAL_MASK: u32 = 0x7f << FSCALE_VAL_SHIFT;
    pub const FSCALE_CMD_LOAD: u32 = 1 << 9;
    pub const DISABLE_RAM_CLK_GATING: u32 = 1 << 10;
    pub const DISABLE_DEBUG_REGISTERS: u32 = 1 << 11;
    pub const SOFT_RESET: u32 = 1 << 12;
    pub const IDLE_3D: u32 = 1 << 16;
    pub const IDLE_2D: u32 = 1 << 17;
    pub const IDLE_VG: u32 = 1 << 18;
    pub const ISOLATE_GPU: u32 = 1 << 19;

    pub const fn fscale_val(fscale: u32) -> u32 {
        (fscale << FSCALE_VAL_SHIFT) & FSCALE_VAL_MASK
    }
}

pub mod chip_identity {
    pub const FAMILY_SHIFT: u32 = 24;
    pub const FAMILY_MASK: u32 = 0xff << FAMILY_SHIFT;
    pub const REVISION_SHIFT: u32 = 12;
    pub const REVISION_MASK: u32 = 0xf << REVISION_SHIFT;
}

pub mod pm {
    //! Power management block.

    pub const POWER_CONTROLS: u32 = 0x0100;
    pub const MODULE_CONTROLS: u32 = 0x0104;
    pub const MODULE_STATUS: u32 = 0x0108;

    pub const POWER_CONTROLS_ENABLE_MODULE_CLOCK_GATING: u32 = 1 << 0;
}

pub mod mmu {
    pub const STATUS: u32 = 0x0188;
    pub const EXCEPTION_ADDR_BASE: u32 = 0x0380;
    pub const AHB_CONTROL: u32 = 0x03a8;

    pub const AHB_CONTROL_RESET: u32 = 1 << 0;
    pub const MMU_COUNT: u32 = 4;

    pub const fn exception_addr(index: u32) -> u32 {
        EXCEPTION_ADDR_BASE + index * 4
    }
}

pub mod fe {
    //! Front end (command fetch) block.

    pub const COMMAND_ADDRESS: u32 = 0x0654;
    pub const COMMAND_CONTROL: u32 = 0x0658;
    pub const DMA_STATUS: u32 = 0x065c;
    pub const DMA_DEBUG_STATE: u32 = 0x0660;
    pub const DMA_ADDRESS: u32 = 0x0664;
    pub const DMA_LOW: u32 = 0x0668;
    pub const DMA_HIGH: u32 = 0x066c;

    pub const COMMAND_CONTROL_PREFETCH_MASK: u32 = 0xffff;
    pub const COMMAND_CONTROL_ENABLE: u32 = 1 << 16;
}

pub mod perfmon {
    pub const SELECT: u32 = 0x0470;
    pub const VALUE: u32 = 0x0474;
}

pub mod gl {
    //! Graphics-level states loaded through the command stream.

    pub const PIPE_SELECT: u32 = 0x3800;
    pub const EVENT: u32 = 0x3804;
    pub const SEMAPHORE_TOKEN: u32 = 0x3808;
    pub const FLUSH_CACHE: u32 = 0x380c;
    pub const FLUSH_MMU: u32 = 0x3810;

    pub const EVENT_EVT_ID_MASK: u32 = 0x1f;
    pub const EVENT_FROM_FE: u32 = 1 << 5;
    pub const EVENT_FROM_PE: u32 = 1 << 6;

    pub const FLUSH_CACHE_ALL: u32 = 0x3f;
    pub const FLUSH_MMU_ALL: u32 = 0x1f;

    pub const SEMAPHORE_FROM_FE: u32 = 0x01;
    pub const SEMAPHORE_TO_PE: u32 = 0x07;
}

bitflags! {
    /// `HI_IDLE_STATE`: one bit per sub-block, set while that block is idle.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IdleState: u32 {
        const FE = 1 << 0;
        const DE = 1 << 1;
        const PE = 1 << 2;
        const SH = 1 << 3;
        const PA = 1 << 4;
        const SE = 1 << 5;
        const RA = 1 << 6;
        const TX = 1 << 7;
        const VG = 1 << 8;
        const IM = 1 << 9;
        const FP = 1 << 10;
        const TS = 1 << 11;
        const BL = 1 << 12;
        const AXI_LP = 1 << 31;
    }
}

bitflags! {
    /// `HI_INTR_ACKNOWLEDGE`: event vector plus fault conditions.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct IntrAck: u32 {
        const EVENT_VECTOR = 0x3fff_ffff;
        const MMU_EXCEPTION = 1 << 30;
        const AXI_BUS_ERROR = 1 << 31;
    }
}

bitflags! {
    /// `HI_CHIP_FEATURE`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct ChipFeatures: u32 {
        const FAST_CLEAR = 1 << 0;
        const SPECIAL_ANTI_ALIASING = 1 << 1;
        const PIPE_3D = 1 << 2;
        const DXT_TEXTURE_COMPRESSION = 1 << 3;
        const DEBUG_MODE = 1 << 4;
        const Z_COMPRESSION = 1 << 5;
        const MSAA = 1 << 7;
        const PIPE_2D = 1 << 9;
        const PIPE_VG = 1 << 26;
    }
}

bitflags! {
    /// `HI_CHIP_MINOR_FEATURE_0`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MinorFeatures0: u32 {
        const MORE_MINOR_FEATURES = 1 << 21;
        const MC20 = 1 << 22;
        const HZ = 1 << 27;
    }
}

bitflags! {
    /// `HI_CHIP_MINOR_FEATURE_1`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MinorFeatures1: u32 {
        const DISABLE_PE_GATING = 1 << 9;
        const MMU_VERSION = 1 << 28;
    }
}

bitflags! {
    /// `HI_CHIP_MINOR_FEATURE_2`.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MinorFeatures2: u32 {
        const DYNAMIC_FREQUENCY_SCALING = 1 << 19;
        const BLT_ENGINE = 1 << 30;
    }
}

bitflags! {
    /// `PM_MODULE_CONTROLS`: per-module clock gating disables.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ModuleClockGating: u32 {
        const DISABLE_FE = 1 << 0;
        const DISABLE_DE = 1 << 1;
        const DISABLE_PE = 1 << 2;
        const DISABLE_SH = 1 << 3;
        const DISABLE_PA = 1 << 4;
        const DISABLE_SE = 1 << 5;
        const DISABLE_RA = 1 << 6;
        const DISABLE_TX = 1 << 7;
        const UNKNOWN_15 = 1 << 15;
        const DISABLE_RA_EZ = 1 << 16;
        const DISABLE_RA_HZ = 1 << 17;
    }
}
