/// Size of one page / physical frame in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Number of offset bits within a page.
pub const PAGE_OFFSET_BITS: usize = 12;
/// First address above the user half of the address space. User regions
/// must lie entirely below this split.
pub const USER_TOP: usize = 0x8000_0000;
/// Pages reserved for the initial user stack, placed directly below
/// `USER_TOP`.
pub const STACK_PAGES: usize = 16;
/// Hashed-page-table slots provisioned per installed physical frame.
pub const HPT_SLOTS_PER_FRAME: usize = 2;
