// types.rs - CIP elementary data type codes and widths
//
// Every tag and attribute payload in the emulator is stored in packed
// little-endian wire format, so the codec boils down to the type table
// below plus `to_le_bytes`/`from_le_bytes` at the call sites.

/// BOOL, 1 byte (0x00 = false, 0xFF = true)
pub const BOOL: u16 = 0x00C1;
/// SINT, 8-bit signed
pub const SINT: u16 = 0x00C2;
/// INT, 16-bit signed
pub const INT: u16 = 0x00C3;
/// DINT, 32-bit signed
pub const DINT: u16 = 0x00C4;
/// LINT, 64-bit signed
pub const LINT: u16 = 0x00C5;
/// USINT, 8-bit unsigned
pub const USINT: u16 = 0x00C6;
/// UINT, 16-bit unsigned
pub const UINT: u16 = 0x00C7;
/// UDINT, 32-bit unsigned
pub const UDINT: u16 = 0x00C8;
/// ULINT, 64-bit unsigned
pub const ULINT: u16 = 0x00C9;
/// REAL, IEEE-754 single precision
pub const REAL: u16 = 0x00CA;
/// LREAL, IEEE-754 double precision
pub const LREAL: u16 = 0x00CB;
/// STRING, 2-byte character count followed by the characters
pub const STRING: u16 = 0x00D0;
/// DWORD, 32-bit bit string
pub const DWORD: u16 = 0x00D3;
/// SHORT_STRING, 1-byte character count followed by the characters
pub const SHORT_STRING: u16 = 0x00DA;
/// STRINGI, international string
pub const STRINGI: u16 = 0x00DE;

/// Bit set in a SymbolType attribute when the symbol is a 1-D array.
pub const ARRAY_FLAG: u16 = 0x2000;

/// Fixed byte width of an elementary type, or `None` for the string
/// types whose payload is self-describing.
pub fn type_len(typ: u16) -> Option<usize> {
    match typ {
        BOOL | SINT | USINT => Some(1),
        INT | UINT => Some(2),
        DINT | UDINT | REAL | DWORD => Some(4),
        LINT | ULINT | LREAL => Some(8),
        STRING | SHORT_STRING | STRINGI => None,
        _ => None,
    }
}

/// True for every type code this emulator recognizes.
pub fn is_known(typ: u16) -> bool {
    type_len(typ).is_some() || matches!(typ, STRING | SHORT_STRING | STRINGI)
}

/// Display name of a type code, for logs and the host API.
pub fn type_name(typ: u16) -> &'static str {
    match typ {
        BOOL => "BOOL",
        SINT => "SINT",
        INT => "INT",
        DINT => "DINT",
        LINT => "LINT",
        USINT => "USINT",
        UINT => "UINT",
        UDINT => "UDINT",
        ULINT => "ULINT",
        REAL => "REAL",
        LREAL => "LREAL",
        STRING => "STRING",
        DWORD => "DWORD",
        SHORT_STRING => "SHORT_STRING",
        STRINGI => "STRINGI",
        _ => "UNKNOWN",
    }
}
