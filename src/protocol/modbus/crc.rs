//! CRC-16/MODBUS (reflected polynomial 0xA001, initial value 0xFFFF).

/// Compute the CRC over `data`.
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for &b in data {
        crc ^= b as u16;
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc >>= 1;
                crc ^= 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

/// CRC in wire order: low byte first.
pub fn crc16_modbus_bytes(data: &[u8]) -> [u8; 2] {
    crc16_modbus(data).to_le_bytes()
}

/// Append the wire-order CRC to a frame body. Handy for building frames in tests
/// and synthetic sources.
pub fn with_crc(body: &[u8]) -> Vec<u8> {
    let mut frame = body.to_vec();
    frame.extend_from_slice(&crc16_modbus_bytes(body));
    frame
}
