//! Registers of the PLX9054 PCI bridge and the COPPER
//! local bus, as far as the DMA pipeline needs them.
//!
//! Both blocks are addressed with Addr8, each register
//! is 32bit wide, so a new register is the previous
//! register + 4. If two names share an address, the
//! register holds different fields in different bits.
//!
//! PLX9054 offsets follow the PCI 9054 data book v2.1,
//! local configuration space as seen from PCI (BAR0).
//! The COPPER block sits behind BAR2.

//========== PLX9054 Registers ==========
//
//=======================================

pub const PLX9054_REGSIZE : usize = 0x100;

pub const INTCSR   : u32 = 0x68; // Interrupt control/status
pub const DMAMODE0 : u32 = 0x80; // DMA channel 0 mode
pub const DMAPADR0 : u32 = 0x84; // DMA channel 0 PCI address [31:0]
pub const DMALADR0 : u32 = 0x88; // DMA channel 0 local address
pub const DMASIZ0  : u32 = 0x8c; // DMA channel 0 transfer size (bytes)
pub const DMADPR0  : u32 = 0x90; // DMA channel 0 descriptor pointer (direction)
pub const DMACSR0  : u32 = 0xa8; // [7:0] DMA channel 0 command/status
pub const DMADAC0  : u32 = 0xb4; // DMA channel 0 PCI dual address cycle [63:32]

/// INTCSR fields
pub const INTCSR_PCI_ERROR        : u32 = 1 << 2;  // write 1 to clear PCI abort/error
pub const INTCSR_PCI_INT_ENABLE   : u32 = 1 << 8;
pub const INTCSR_LOCAL_INT_ENABLE : u32 = 1 << 11; // local interrupt input enable
pub const INTCSR_LOCAL_INT_ACTIVE : u32 = 1 << 15;
pub const INTCSR_DMA0_INT_ENABLE  : u32 = 1 << 18;
pub const INTCSR_DMA0_INT_ACTIVE  : u32 = 1 << 21;

/// DMACSR0 fields
pub const DMACSR_ENABLE    : u32 = 1 << 0;
pub const DMACSR_START     : u32 = 1 << 1;
pub const DMACSR_ABORT     : u32 = 1 << 2;
pub const DMACSR_CLEAR_INT : u32 = 1 << 3;
pub const DMACSR_DONE      : u32 = 1 << 4;

/// Demand mode, 32bit local bus, ready input,
/// local address held constant (FIFO), DMA done
/// interrupt routed to PCI
pub const DMAMODE0_FIFO_TO_PCI : u32 = 0x205c3;
/// Direction local bus -> PCI
pub const DMADPR0_LOCAL_TO_PCI : u32 = 0x8;

//========== COPPER Registers ===========
//
//=======================================

pub const COPPER_REGSIZE : usize = 0x200;

pub const FF_STA      : u32 = 0x000; // event FIFO status, one byte per FINESSE
pub const FINESSE_STA : u32 = 0x004; // [3:0] FINESSE A-D present
pub const LEF_READSEL : u32 = 0x008; // 1 -> LEF_TOTAL sums all FINESSE
pub const LEF_TOTAL   : u32 = 0x00c; // [31:0] words of the next event (all FINESSE)
pub const LEF_AB      : u32 = 0x010; // length FIFO head A [15:0], B [31:16]
pub const LEF_CD      : u32 = 0x014; // length FIFO head C [15:0], D [31:16]
pub const LEF_STA     : u32 = 0x018; // [15:0] one nibble per FINESSE, length FIFO not empty
pub const INT_STA     : u32 = 0x01c; // pending interrupt sources (see INT_MASK)
pub const INT_MASK    : u32 = 0x020; // enabled interrupt sources
pub const FF_RST      : u32 = 0x024; // [3:0] clear FIFO A-D, [4] FINESSE reset
pub const FF_RW       : u32 = 0x028; // 1 -> allow single word FIFO access

pub const WEA_COUNTER : u32 = 0x030; // words written into FIFO A
pub const WEB_COUNTER : u32 = 0x034;
pub const WEC_COUNTER : u32 = 0x038;
pub const WED_COUNTER : u32 = 0x03c;

pub const CONF_WA_AF  : u32 = 0x040; // event FIFO A almost full threshold
pub const CONF_WB_AF  : u32 = 0x044;
pub const CONF_WC_AF  : u32 = 0x048;
pub const CONF_WD_AF  : u32 = 0x04c;

pub const CONF_WA_FF  : u32 = 0x050; // event FIFO A threshold
pub const CONF_WB_FF  : u32 = 0x054;
pub const CONF_WC_FF  : u32 = 0x058;
pub const CONF_WD_FF  : u32 = 0x05c;

pub const LEF_WA_FF   : u32 = 0x060; // length FIFO A threshold
pub const LEF_WB_FF   : u32 = 0x064;
pub const LEF_WC_FF   : u32 = 0x068;
pub const LEF_WD_FF   : u32 = 0x06c;

pub const LEF_WA_AF   : u32 = 0x070; // length FIFO A almost full
pub const LEF_WB_AF   : u32 = 0x074;
pub const LEF_WC_AF   : u32 = 0x078;
pub const LEF_WD_AF   : u32 = 0x07c;

pub const LWRA_DMA    : u32 = 0x080; // words moved by DMA out of FIFO A
pub const LWRB_DMA    : u32 = 0x084;
pub const LWRC_DMA    : u32 = 0x088;
pub const LWRD_DMA    : u32 = 0x08c;

/// Local bus address of the event FIFO read port,
/// this is what DMALADR0 points to
pub const FF_DMA      : u32 = 0x100;

/// INT_STA/INT_MASK sources
pub const INT_EVENT_FIFO_ALMOST_FULL  : u32 = 0x1;
pub const INT_LENGTH_FIFO_ALMOST_FULL : u32 = 0x2;
pub const INT_LENGTH_FIFO_THRESHOLD   : u32 = 0x4;
pub const INT_ALL                     : u32 = 0x7;

/// FF_STA full bit of each FINESSE
pub const FF_STA_FULL_MASK : u32 = 0x10101010;

/// FF_RST commands
pub const FF_RST_CLEAR_FIFOS : u32 = 0x0f;
pub const FF_RST_FINESSE     : u32 = 0x10;

/// Names of the registers which can be read
/// through the ioctl passthrough (diagnostics)
pub const COPPER_NAMED_REGISTERS : [(&str, u32); 17] = [
  ("FF_STA"      , FF_STA      ),
  ("FINESSE_STA" , FINESSE_STA ),
  ("LEF_READSEL" , LEF_READSEL ),
  ("LEF_TOTAL"   , LEF_TOTAL   ),
  ("LEF_AB"      , LEF_AB      ),
  ("LEF_CD"      , LEF_CD      ),
  ("LEF_STA"     , LEF_STA     ),
  ("INT_STA"     , INT_STA     ),
  ("INT_MASK"    , INT_MASK    ),
  ("WEA_COUNTER" , WEA_COUNTER ),
  ("WEB_COUNTER" , WEB_COUNTER ),
  ("WEC_COUNTER" , WEC_COUNTER ),
  ("WED_COUNTER" , WED_COUNTER ),
  ("LWRA_DMA"    , LWRA_DMA    ),
  ("LWRB_DMA"    , LWRB_DMA    ),
  ("LWRC_DMA"    , LWRC_DMA    ),
  ("LWRD_DMA"    , LWRD_DMA    ),
];

pub const PLX9054_NAMED_REGISTERS : [(&str, u32); 8] = [
  ("INTCSR"   , INTCSR  ),
  ("DMAMODE0" , DMAMODE0),
  ("DMAPADR0" , DMAPADR0),
  ("DMALADR0" , DMALADR0),
  ("DMASIZ0"  , DMASIZ0 ),
  ("DMADPR0"  , DMADPR0 ),
  ("DMACSR0"  , DMACSR0 ),
  ("DMADAC0"  , DMADAC0 ),
];
