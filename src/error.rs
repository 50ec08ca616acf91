/// Удобный тип результата для библиотеки.
pub type Result<T> = std::result::Result<T, SingleError>;

/// Ошибки, которые может возвращать библиотека.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SingleError {
    /// Именованный сегмент уже создан другим процессом.
    #[error("shared block already exists")]
    AlreadyExists,
    /// Именованный сегмент не найден (primary успел завершиться).
    #[error("shared block not found")]
    NotFound,
    /// Сегмент создан, но ещё не инициализирован создателем.
    #[error("shared block is not initialized yet")]
    NotReady,
    /// Ожидаемое событие не произошло в отведённое время.
    #[error("operation timed out")]
    Timeout,
    /// Primary закрыл соединение, не подтвердив handshake.
    #[error("handshake rejected by primary")]
    HandshakeRejected,
    /// Сообщение превышает допустимый размер кадра.
    #[error("message is too large")]
    MessageTooLarge,
    /// Данные повреждены (контрольная сумма или формат).
    #[error("data is corrupted")]
    Corrupted,
    /// Соединение с primary отсутствует.
    #[error("not connected to primary")]
    NotConnected,
    /// Операция доступна только вторичному экземпляру.
    #[error("operation requires a secondary instance")]
    NotSecondary,
    /// Имя нельзя передать в системный вызов (например, содержит NUL).
    #[error("invalid rendezvous name")]
    InvalidName,
    /// Системная ошибка (errno).
    #[error("os error {code} while {context}")]
    Os {
        /// Код errno.
        code: i32,
        /// Контекст операции.
        context: &'static str,
    },
    /// Ошибка ввода-вывода стандартной библиотеки.
    #[error("io error {kind:?} while {context}")]
    Io {
        /// Вид ошибки.
        kind: std::io::ErrorKind,
        /// Контекст операции.
        context: &'static str,
    },
}

impl SingleError {
    pub(crate) fn last_os(context: &'static str) -> Self {
        Self::from_io(std::io::Error::last_os_error(), context)
    }

    pub(crate) fn from_io(err: std::io::Error, context: &'static str) -> Self {
        // SO_RCVTIMEO на Unix отдаёт EAGAIN, а не ETIMEDOUT
        match err.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => SingleError::Timeout,
            kind => match err.raw_os_error() {
                Some(code) => SingleError::Os { code, context },
                None => SingleError::Io { kind, context },
            },
        }
    }
}
