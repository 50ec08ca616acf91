use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::constants::BLOCK_SETTLE_TIMEOUT;
use crate::error::{Result, SingleError};
use crate::layout::block_mapping_size;
use crate::naming::shm_name;
use crate::random_sleep;
use crate::shared::SharedBlock;
use crate::unix::{process_id, AccessMode, ShmHandle};

/// Итог выборов.
pub enum Outcome<T> {
    /// Сегмент создан нами; `T` - результат запуска слушателя.
    Primary(T),
    /// Сегмент уже был; номер присвоен под блокировкой.
    Secondary { instance_number: u32 },
}

pub struct Elected<T> {
    pub block: SharedBlock,
    pub outcome: Outcome<T>,
}

/// Выборы primary по имени точки встречи.
///
/// Создатель сегмента становится primary: под блокировкой блок обнуляется,
/// вызывается `start_primary` (поднимает слушатель) и только затем блок
/// публикуется с `primary = 1`, pid и пользователем. Остальные видят блок уже
/// в согласованном виде и становятся secondary с очередным номером.
///
/// Ошибка создания сегмента, кроме «уже существует», фатальна.
pub fn elect<T, F>(name: &str, access: AccessMode, user: &str, start_primary: F) -> Result<Elected<T>>
where
    F: FnOnce() -> Result<T>,
{
    elect_within(name, access, user, BLOCK_SETTLE_TIMEOUT, start_primary)
}

/// То же, что [`elect`], но сегмент без primary или в несогласованном
/// состоянии считается брошенным через `settle`.
fn elect_within<T, F>(
    name: &str,
    access: AccessMode,
    user: &str,
    settle: Duration,
    start_primary: F,
) -> Result<Elected<T>>
where
    F: FnOnce() -> Result<T>,
{
    let shm = shm_name(name);
    let started = Instant::now();

    loop {
        match SharedBlock::create(&shm, access) {
            Ok(block) => return become_primary(block, user, start_primary),
            Err(SingleError::AlreadyExists) => {}
            Err(err) => return Err(err),
        }

        let block = match SharedBlock::attach(&shm) {
            Ok(block) => block,
            // primary ушёл между create и open
            Err(SingleError::NotFound) => continue,
            Err(SingleError::NotReady) => {
                if started.elapsed() >= settle {
                    abandon_unsized(&shm)?;
                } else {
                    random_sleep();
                }
                continue;
            }
            Err(err) => return Err(err),
        };

        let mut guard = block.lock()?;
        let expired = started.elapsed() >= settle;
        if !guard.is_consistent() {
            if !expired {
                drop(guard);
                random_sleep();
                continue;
            }
            warn!(name, "shared block inconsistent for too long, assuming primary failure");
            guard.initialize();
        }

        if !guard.block().is_primary() {
            // имя удаляется под блокировкой и только если указывает на этот
            // сегмент: другой ожидающий мог уже пересоздать его
            if expired && block.unlink_if_current()? {
                warn!(name, "shared block has no primary, removed abandoned name");
            }
            drop(guard);
            if !expired {
                random_sleep();
            }
            continue;
        }

        let block_ref = guard.block_mut();
        block_ref.secondary = block_ref.secondary.wrapping_add(1);
        let instance_number = block_ref.secondary;
        guard.seal();
        drop(guard);

        debug!(name, instance_number, "elected secondary");
        return Ok(Elected {
            block,
            outcome: Outcome::Secondary { instance_number },
        });
    }
}

fn become_primary<T, F>(block: SharedBlock, user: &str, start_primary: F) -> Result<Elected<T>>
where
    F: FnOnce() -> Result<T>,
{
    let mut guard = block.lock()?;
    guard.initialize();

    let started = match start_primary() {
        Ok(started) => started,
        Err(err) => {
            drop(guard);
            let _ = block.unlink();
            return Err(err);
        }
    };

    let pid = process_id();
    let inst = guard.block_mut();
    inst.primary = 1;
    inst.primary_pid = pid;
    inst.set_user(user);
    guard.seal();
    drop(guard);

    info!(name = block.name(), pid, "elected primary");
    Ok(Elected {
        block,
        outcome: Outcome::Primary(started),
    })
}

/// Создатель так и не задал размер сегмента: удаляем имя под блокировкой.
fn abandon_unsized(shm: &str) -> Result<()> {
    let handle = match ShmHandle::open(shm) {
        Ok(handle) => handle,
        Err(SingleError::NotFound) => return Ok(()),
        Err(err) => return Err(err),
    };
    let _lock = handle.lock()?;
    if handle.len()? < block_mapping_size() && handle.unlink_if_current()? {
        warn!(name = shm, "shared block was never sized, removed abandoned name");
    }
    Ok(())
}

/// Освобождение роли primary при выходе.
///
/// Счётчик secondary не сбрасывается; имя удаляется, чтобы следующий запуск
/// создал сегмент заново.
pub fn retire(block: &SharedBlock) -> Result<()> {
    let mut guard = block.lock()?;
    let inst = guard.block_mut();
    inst.primary = 0;
    inst.primary_pid = -1;
    inst.set_user("");
    guard.seal();
    let unlinked = block.unlink_if_current();
    drop(guard);

    debug!(name = block.name(), "primary retired");
    unlinked.map(|_| ())
}
