use std::time::Duration;

/// Префикс, с которого начинается дайджест имени.
pub const NAME_DIGEST_SEED: &[u8] = b"SingleApplication";

/// Размер буфера имени пользователя в блоке (включая завершающий NUL).
pub const PRIMARY_USER_LEN: usize = 128;

/// Байт подтверждения кадра.
pub const ACK_BYTE: u8 = b'\n';

/// Размер заголовочного кадра (u64 длины тела).
pub const FRAME_HEADER_SIZE: usize = 8;

/// Максимальный размер тела handshake.
pub const MAX_HANDSHAKE_LEN: u64 = 1024;
/// Максимальный размер тела полезного кадра.
pub const MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Минимальная фиксированная часть тела handshake:
/// u32 длины имени + u8 типа + u32 идентификатора + u16 контрольной суммы.
pub const HANDSHAKE_FIXED_LEN: usize = 4 + 1 + 4 + 2;

/// Диапазон случайной паузы перед попыткой подключения (мс, полуоткрытый).
pub const BACKOFF_MIN_MS: u64 = 8;
pub const BACKOFF_MAX_MS: u64 = 18;

/// Сколько ждать, пока блок станет согласованным, прежде чем считать создателя погибшим.
pub const BLOCK_SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Таймаут подключения и подтверждения кадров по умолчанию.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
/// Период пробуждения реактора (ограничивает задержку остановки).
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Размер буфера чтения реактора.
pub const READ_CHUNK: usize = 16 * 1024;
