pub const HASH_SIZE: usize = 32;
pub const HASH_HEX_SIZE: usize = HASH_SIZE * 2;
pub const HEADER_SIZE: usize = 80;
pub const ADDRESS_HASH_SIZE: usize = 20;
pub const PEER_ADDRESS_SIZE: usize = 30;
pub const DEFAULT_PORT: u16 = 8333;
pub const MAX_BLOCKS_PER_INV: usize = 500;
pub const MAX_HEADERS_PER_REPLY: usize = 2000;
