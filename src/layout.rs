use core::mem::offset_of;

use crate::constants::PRIMARY_USER_LEN;

/// Блок состояния в разделяемой памяти.
///
/// Поле `checksum` обязано быть последним: сумма считается по всем байтам до него.
#[repr(C)]
pub struct IdentityBlock {
    pub primary: u8,
    pub reserved: [u8; 3],
    pub secondary: u32,
    pub primary_pid: i64,
    pub primary_user: [u8; PRIMARY_USER_LEN],
    pub checksum: u16,
}

/// Граница контрольной суммы.
pub const CHECKSUM_OFFSET: usize = offset_of!(IdentityBlock, checksum);

/// Размер сегмента разделяемой памяти.
pub const fn block_mapping_size() -> usize {
    core::mem::size_of::<IdentityBlock>()
}

impl IdentityBlock {
    pub fn reset(&mut self) {
        self.primary = 0;
        self.reserved = [0; 3];
        self.secondary = 0;
        self.primary_pid = -1;
        self.primary_user = [0; PRIMARY_USER_LEN];
    }

    pub fn is_primary(&self) -> bool {
        self.primary != 0
    }

    /// Записывает имя с обрезкой и завершающим NUL.
    pub fn set_user(&mut self, user: &str) {
        self.primary_user = [0; PRIMARY_USER_LEN];
        let bytes = user.as_bytes();
        let len = bytes.len().min(PRIMARY_USER_LEN - 1);
        self.primary_user[..len].copy_from_slice(&bytes[..len]);
    }

    pub fn user(&self) -> String {
        let end = self
            .primary_user
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PRIMARY_USER_LEN);
        String::from_utf8_lossy(&self.primary_user[..end]).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_trailing_field() {
        assert_eq!(CHECKSUM_OFFSET, 1 + 3 + 4 + 8 + PRIMARY_USER_LEN);
        assert!(block_mapping_size() >= CHECKSUM_OFFSET + 2);
    }

    #[test]
    fn long_user_is_truncated() {
        let mut block = IdentityBlock {
            primary: 0,
            reserved: [0; 3],
            secondary: 0,
            primary_pid: 0,
            primary_user: [0xAA; PRIMARY_USER_LEN],
            checksum: 0,
        };
        let long = "u".repeat(300);
        block.set_user(&long);
        assert_eq!(block.user().len(), PRIMARY_USER_LEN - 1);
        assert_eq!(block.primary_user[PRIMARY_USER_LEN - 1], 0);

        block.set_user("bob");
        assert_eq!(block.user(), "bob");
    }
}
