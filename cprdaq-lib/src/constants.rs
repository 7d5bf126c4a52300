//! Numbers which are fixed by the hardware or 
//! by the format of the data stream

/// Size of a 32bit word in bytes. The COPPER
/// FIFO and all registers are 32bit wide.
pub const SIZEOF_U32 : usize = 4;

/// Host page size used to dimension the DMA buffers
pub const PAGE_SIZE : usize = 4096;

/// Default number of DMA buffers in the ring
pub const DEFAULT_N_DMA_BUFFERS : usize = 4;

/// Default size of one DMA buffer, as 
/// power of two of pages (2^9 pages = 2 MiB)
pub const DEFAULT_DMA_PAGES : u32 = 9;

/// Number of descriptor slots the event 
/// queue grows by, whenever it runs dry
pub const DEFAULT_QUEUE_ALLOTMENT : usize = 32*1024;

/// Give up polling for the DMA done bit 
/// after this many register reads
pub const DEFAULT_ABORT_RETRIES : usize = 100;

/// Stop complaining about lost DMA done 
/// interrupts after this many
pub const DEFAULT_LOST_INTR_LIMIT : u32 = 10;

/// Almost full threshold of the length FIFOs
pub const DEFAULT_LEF_ALMOST_FULL : u32 = 256;

//========== event record (hardware) ===========

/// First word of every event record the 
/// COPPER writes into the event FIFO
pub const RECORD_MAGIC        : u32   = 0xFFFFFAFA;
/// Last word of every event record
pub const RECORD_TRAILER      : u32   = 0xFFFFF5F5;
/// magic, total size, 4 FINESSE sizes
pub const RECORD_HEADER_WORDS : usize = 6;
/// the trailer
pub const RECORD_TRAILER_WORDS: usize = 1;
/// Number of FINESSE slots (A-D)
pub const N_FINESSE           : usize = 4;

//========== event stream (driver) =============

/// First word of the header the driver 
/// puts in front of every event
pub const DRIVER_HEADER_MAGIC : u32   = 0x7FFF0008;
/// Last word of the footer the driver 
/// appends to every event
pub const DRIVER_FOOTER_MAGIC : u32   = 0x7FFF0009;
/// magic, event number, subsys, crate, slot, 2x reserved
pub const DRIVER_HEADER_WORDS : usize = 7;
/// checksum, magic
pub const DRIVER_FOOTER_WORDS : usize = 2;
pub const DRIVER_HEADER_SIZE  : usize = DRIVER_HEADER_WORDS*SIZEOF_U32;
pub const DRIVER_FOOTER_SIZE  : usize = DRIVER_FOOTER_WORDS*SIZEOF_U32;
