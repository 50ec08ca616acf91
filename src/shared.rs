use std::ptr::NonNull;

use crate::checksum::checksum;
use crate::error::{Result, SingleError};
use crate::layout::{block_mapping_size, IdentityBlock, CHECKSUM_OFFSET};
use crate::unix::{AccessMode, FileLock, Mapping, ShmHandle};

/// Отображённый в память блок состояния.
pub struct SharedBlock {
    handle: ShmHandle,
    mapping: Mapping,
}

impl SharedBlock {
    /// Создаёт сегмент; `AlreadyExists`, если он уже есть.
    pub fn create(name: &str, mode: AccessMode) -> Result<Self> {
        let handle = ShmHandle::create(name, mode)?;
        let size = block_mapping_size();
        let mapping = handle.set_len(size).and_then(|_| handle.map(size));
        match mapping {
            Ok(mapping) => Ok(Self { handle, mapping }),
            Err(err) => {
                let _ = ShmHandle::unlink(name);
                Err(err)
            }
        }
    }

    /// Подключается к существующему сегменту.
    ///
    /// `NotReady`, если создатель ещё не задал размер.
    pub fn attach(name: &str) -> Result<Self> {
        let handle = ShmHandle::open(name)?;
        let size = block_mapping_size();
        if handle.len()? < size {
            return Err(SingleError::NotReady);
        }
        let mapping = handle.map(size)?;
        Ok(Self { handle, mapping })
    }

    pub fn name(&self) -> &str {
        self.handle.name()
    }

    /// Захватывает межпроцессную блокировку блока.
    pub fn lock(&self) -> Result<BlockGuard<'_>> {
        let lock = self.handle.lock()?;
        debug_assert!(self.mapping.len() >= block_mapping_size());
        let ptr = NonNull::new(self.mapping.as_ptr() as *mut IdentityBlock)
            .ok_or(SingleError::Corrupted)?;
        Ok(BlockGuard { _lock: lock, ptr })
    }

    /// Удаляет имя сегмента, чтобы следующий процесс смог его создать заново.
    pub fn unlink(&self) -> Result<()> {
        ShmHandle::unlink(self.handle.name())
    }

    /// Удаляет имя, только если оно ещё указывает на этот сегмент.
    /// Вызывать под `lock()`.
    pub fn unlink_if_current(&self) -> Result<bool> {
        self.handle.unlink_if_current()
    }

    /// Чтение pid primary под блокировкой.
    pub fn primary_pid(&self) -> Result<i64> {
        Ok(self.lock()?.block().primary_pid)
    }

    /// Чтение имени пользователя primary под блокировкой.
    pub fn primary_user(&self) -> Result<String> {
        Ok(self.lock()?.block().user())
    }
}

/// Доступ к блоку, пока удерживается блокировка.
pub struct BlockGuard<'a> {
    _lock: FileLock<'a>,
    ptr: NonNull<IdentityBlock>,
}

impl BlockGuard<'_> {
    pub fn block(&self) -> &IdentityBlock {
        unsafe { self.ptr.as_ref() }
    }

    pub fn block_mut(&mut self) -> &mut IdentityBlock {
        unsafe { self.ptr.as_mut() }
    }

    fn compute_checksum(&self) -> u16 {
        let bytes =
            unsafe { std::slice::from_raw_parts(self.ptr.as_ptr() as *const u8, CHECKSUM_OFFSET) };
        checksum(bytes)
    }

    pub fn is_consistent(&self) -> bool {
        self.compute_checksum() == self.block().checksum
    }

    /// Пересчитывает контрольную сумму после изменения.
    pub fn seal(&mut self) {
        let sum = self.compute_checksum();
        self.block_mut().checksum = sum;
    }

    /// Пустой блок: primary нет, счётчик обнулён.
    pub fn initialize(&mut self) {
        self.block_mut().reset();
        self.seal();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_name(tag: &str) -> String {
        use std::time::SystemTime;
        let ts = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("/xsingle_block_{}_{}_{}", tag, std::process::id(), ts % 1_000_000)
    }

    #[test]
    fn mutation_visible_across_attachments() {
        let name = unique_name("share");
        let owner = SharedBlock::create(&name, AccessMode::User).unwrap();
        {
            let mut guard = owner.lock().unwrap();
            guard.initialize();
            guard.block_mut().primary = 1;
            guard.block_mut().primary_pid = 4242;
            guard.block_mut().set_user("carol");
            guard.seal();
        }

        let other = SharedBlock::attach(&name).unwrap();
        {
            let guard = other.lock().unwrap();
            assert!(guard.is_consistent());
            assert!(guard.block().is_primary());
        }
        assert_eq!(other.primary_pid().unwrap(), 4242);
        assert_eq!(other.primary_user().unwrap(), "carol");

        owner.unlink().unwrap();
    }

    #[test]
    fn unsealed_write_is_detected() {
        let name = unique_name("tamper");
        let owner = SharedBlock::create(&name, AccessMode::User).unwrap();
        let mut guard = owner.lock().unwrap();
        guard.initialize();
        assert!(guard.is_consistent());
        guard.block_mut().secondary = 7;
        assert!(!guard.is_consistent());
        guard.seal();
        assert!(guard.is_consistent());
        drop(guard);
        owner.unlink().unwrap();
    }

    #[test]
    fn attach_missing_is_not_found() {
        let name = unique_name("missing");
        assert!(matches!(
            SharedBlock::attach(&name),
            Err(SingleError::NotFound)
        ));
    }
}
