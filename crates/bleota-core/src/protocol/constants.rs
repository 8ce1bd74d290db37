use uuid::Uuid;

// Command identifiers (command channel)
pub const COMMAND_ID_START: u16 = 0x0001;
pub const COMMAND_ID_END: u16 = 0x0002;
pub const COMMAND_ID_ACK: u16 = 0x0003;

// Command ACK status
pub const COMMAND_ACK_ACCEPT: u16 = 0x0000;
pub const COMMAND_ACK_REFUSE: u16 = 0x0001;

// Sector ACK status (firmware receive channel)
pub const SECTOR_ACK_SUCCESS: u16 = 0x0000;
pub const SECTOR_ACK_CRC_ERROR: u16 = 0x0001;
pub const SECTOR_ACK_INDEX_ERROR: u16 = 0x0002;
pub const SECTOR_ACK_PAYLOAD_LENGTH_ERROR: u16 = 0x0003;

// Command frame layout
pub const COMMAND_PACKET_SIZE: usize = 20;
pub const COMMAND_PAYLOAD_SIZE: usize = 16;
pub const COMMAND_CRC_OFFSET: usize = 18;

// Firmware packet layout
pub const SECTOR_SIZE: usize = 4096;
pub const PACKET_HEADER_SIZE: usize = 3;
pub const SECTOR_CRC_SIZE: usize = 2;
pub const LAST_BLOCK_SEQUENCE: u8 = 0xFF;

// Link negotiation
pub const MTU_REQUEST: u16 = 517;
pub const MIN_MTU: u16 = 23;
pub const ATT_HEADER_SIZE: usize = 3;
pub const EXPECT_PACKET_SIZE: usize = 463;
pub const DEFAULT_PACKET_SIZE: usize = 20;
pub const MAX_PACKET_SIZE: usize = MTU_REQUEST as usize - ATT_HEADER_SIZE;

/// Ordinals 0..=254 plus the terminal block, which is tagged [`LAST_BLOCK_SEQUENCE`].
pub const MAX_BLOCKS_PER_SECTOR: usize = LAST_BLOCK_SEQUENCE as usize + 1;
pub const MAX_SECTORS: usize = u16::MAX as usize + 1;

// GATT layout (16-bit UUIDs on the Bluetooth base UUID)
pub const SERVICE_UUID: Uuid = ble_uuid(0x8018);
pub const CHAR_RECV_FW_UUID: Uuid = ble_uuid(0x8020);
pub const CHAR_PROGRESS_UUID: Uuid = ble_uuid(0x8021);
pub const CHAR_COMMAND_UUID: Uuid = ble_uuid(0x8022);
pub const CHAR_CUSTOMER_UUID: Uuid = ble_uuid(0x8023);
pub const NOTIFY_DESCRIPTOR_UUID: Uuid = ble_uuid(0x2902);

const BLUETOOTH_BASE_UUID: u128 = 0x0000_0000_0000_1000_8000_0080_5f9b_34fb;

/// Expand a 16-bit SIG-style UUID onto the Bluetooth base UUID.
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((short as u128) << 96))
}
