//! Reading and writing immediates inside emitted code.

use crate::AsmError;
use byteorder::{ByteOrder, LittleEndian};

fn field(code: &[u8], at: usize, width: usize) -> Result<&[u8], AsmError> {
    match at.checked_add(width) {
        Some(end) if end <= code.len() => Ok(&code[at..end]),
        _ => Err(AsmError::ImmOutOfBounds { at, width, len: code.len() }),
    }
}

fn field_mut(code: &mut [u8], at: usize, width: usize) -> Result<&mut [u8], AsmError> {
    let len = code.len();
    match at.checked_add(width) {
        Some(end) if end <= len => Ok(&mut code[at..end]),
        _ => Err(AsmError::ImmOutOfBounds { at, width, len }),
    }
}

pub fn read_i32(code: &[u8], at: usize) -> Result<i32, AsmError> {
    Ok(LittleEndian::read_i32(field(code, at, 4)?))
}

pub fn write_i32(code: &mut [u8], at: usize, value: i32) -> Result<(), AsmError> {
    LittleEndian::write_i32(field_mut(code, at, 4)?, value);
    Ok(())
}

pub fn read_u64(code: &[u8], at: usize) -> Result<u64, AsmError> {
    Ok(LittleEndian::read_u64(field(code, at, 8)?))
}

pub fn write_u64(code: &mut [u8], at: usize, value: u64) -> Result<(), AsmError> {
    LittleEndian::write_u64(field_mut(code, at, 8)?, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_in_place() {
        let mut code = vec![0x48, 0x81, 0xF9, 0x00, 0x90, 0x00, 0x00];
        assert_eq!(read_i32(&code, 3).unwrap(), 0x9000);
        write_i32(&mut code, 3, -0xA000).unwrap();
        assert_eq!(read_i32(&code, 3).unwrap(), -0xA000);
        assert_eq!(&code[..3], &[0x48, 0x81, 0xF9]);
    }

    #[test]
    fn out_of_bounds() {
        let code = [0u8; 6];
        assert!(matches!(
            read_u64(&code, 0),
            Err(AsmError::ImmOutOfBounds { at: 0, width: 8, len: 6 })
        ));
        assert!(read_i32(&code, usize::MAX).is_err());
    }
}
