//! VPM and DMA setup words for vc4 bulk transfers.
//!
//! Every vc4 load/store goes through the Vertex Pipe Memory: DMA moves a
//! 16-lane row between main memory and the VPM, the QPU reads/writes the
//! row through the VPM ports. The setup words written to `rd_setup` /
//! `wr_setup` select both the mode (VPM access vs. DMA transfer) and the
//! geometry. The builders and the decoder below are the single point of
//! truth for their layout; the emulator interprets the words through
//! [`decode_setup`].

// Field positions, write setups (id in the top two bits).
const ID_SHIFT: u32 = 30;
const ID_VPM: u32 = 0b00;
const ID_DMA_STORE: u32 = 0b10;

const VPM_STRIDE_SHIFT: u32 = 12;
const VPM_HORIZ_BIT: u32 = 11;
const VPM_SIZE_SHIFT: u32 = 8; // 0b10 = 32-bit
const VPM_SIZE_32: u32 = 0b10;
const VPM_NUM_SHIFT: u32 = 20; // read setup only

const DMA_ST_UNITS_SHIFT: u32 = 23;
const DMA_ST_DEPTH_SHIFT: u32 = 16;
const DMA_ST_HORIZ_BIT: u32 = 14;
const DMA_ST_ADDR_SHIFT: u32 = 3;

// Load setup (id in the top bit).
const DMA_LD_ID_BIT: u32 = 31;
const DMA_LD_ROWLEN_SHIFT: u32 = 20;
const DMA_LD_NROWS_SHIFT: u32 = 16;
const DMA_LD_VPITCH_SHIFT: u32 = 12;
const DMA_LD_VERT_BIT: u32 = 11;

/// Configure a horizontal 32-bit VPM write at `addr`.
pub fn vpm_write_setup(stride: u32, addr: u32) -> i32 {
    ((ID_VPM << ID_SHIFT)
        | (stride << VPM_STRIDE_SHIFT)
        | (1 << VPM_HORIZ_BIT)
        | (VPM_SIZE_32 << VPM_SIZE_SHIFT)
        | (addr & 0xff)) as i32
}

/// Configure a horizontal 32-bit VPM read of `num` rows at `addr`.
pub fn vpm_read_setup(num: u32, stride: u32, addr: u32) -> i32 {
    ((ID_VPM << ID_SHIFT)
        | ((num & 0xf) << VPM_NUM_SHIFT)
        | (stride << VPM_STRIDE_SHIFT)
        | (1 << VPM_HORIZ_BIT)
        | (VPM_SIZE_32 << VPM_SIZE_SHIFT)
        | (addr & 0xff)) as i32
}

/// Configure a DMA store of `units` rows of `depth` words from VPM `addr`.
pub fn dma_store_setup(units: u32, depth: u32, vpm_addr: u32) -> i32 {
    ((ID_DMA_STORE << ID_SHIFT)
        | ((units & 0x7f) << DMA_ST_UNITS_SHIFT)
        | ((depth & 0x7f) << DMA_ST_DEPTH_SHIFT)
        | (1 << DMA_ST_HORIZ_BIT)
        | ((vpm_addr & 0x7ff) << DMA_ST_ADDR_SHIFT)) as i32
}

/// Configure a DMA load of `nrows` rows of `row_len` words into VPM `addr`.
/// `row_len` and `nrows` are 4-bit fields in which 0 encodes 16.
pub fn dma_load_setup(row_len: u32, nrows: u32, vpm_addr: u32) -> i32 {
    ((1 << DMA_LD_ID_BIT)
        | ((row_len & 0xf) << DMA_LD_ROWLEN_SHIFT)
        | ((nrows & 0xf) << DMA_LD_NROWS_SHIFT)
        | (1 << DMA_LD_VPITCH_SHIFT)
        | (0 << DMA_LD_VERT_BIT)
        | (vpm_addr & 0x7ff)) as i32
}

/// A decoded setup word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Setup {
    VpmWrite { stride: u32, addr: u32 },
    VpmRead { num: u32, stride: u32, addr: u32 },
    DmaStore { units: u32, depth: u32, vpm_addr: u32 },
    DmaLoad { row_len: u32, nrows: u32, vpm_addr: u32 },
}

/// Decode a word written to `wr_setup` (`for_read == false`) or
/// `rd_setup` (`for_read == true`).
pub fn decode_setup(word: i32, for_read: bool) -> Setup {
    let w = word as u32;
    if for_read && (w >> DMA_LD_ID_BIT) == 1 {
        return Setup::DmaLoad {
            row_len: (w >> DMA_LD_ROWLEN_SHIFT) & 0xf,
            nrows: (w >> DMA_LD_NROWS_SHIFT) & 0xf,
            vpm_addr: w & 0x7ff,
        };
    }
    match w >> ID_SHIFT {
        ID_DMA_STORE => Setup::DmaStore {
            units: (w >> DMA_ST_UNITS_SHIFT) & 0x7f,
            depth: (w >> DMA_ST_DEPTH_SHIFT) & 0x7f,
            vpm_addr: (w >> DMA_ST_ADDR_SHIFT) & 0x7ff,
        },
        _ if for_read => Setup::VpmRead {
            num: (w >> VPM_NUM_SHIFT) & 0xf,
            stride: (w >> VPM_STRIDE_SHIFT) & 0x3f,
            addr: w & 0xff,
        },
        _ => Setup::VpmWrite {
            stride: (w >> VPM_STRIDE_SHIFT) & 0x3f,
            addr: w & 0xff,
        },
    }
}

// ─── Tests ────────────────────────────────────────────────────────
