use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{info, warn};

use crate::client::LocalConnector;
use crate::connection::ServerContext;
use crate::constants::{DEFAULT_POLL_INTERVAL, DEFAULT_TIMEOUT};
use crate::election::{self, Outcome};
use crate::error::{Result, SingleError};
use crate::naming::{block_server_name, AppIdentity, NameOptions};
use crate::protocol::ConnectionType;
use crate::server::LocalListener;
use crate::shared::SharedBlock;
use crate::unix::{current_user, AccessMode};

/// Обработчик событий primary. Вызывается из потока реактора.
pub trait InstanceHandler: Send + Sync + 'static {
    /// Запустился новый экземпляр (или secondary с включёнными уведомлениями).
    fn on_instance_started(&self) {}
    /// Полезная нагрузка от secondary с номером `instance_id`.
    fn on_message(&self, _instance_id: u32, _payload: &[u8]) {}
    fn on_error(&self, _err: SingleError) {}
}

/// Обработчик, которому ничего не нужно (например, у secondary).
pub struct NoopHandler;

impl InstanceHandler for NoopHandler {}

#[derive(Clone, Debug)]
pub struct InstanceOptions {
    /// Один primary на пользователя, а не на систему.
    pub user_scope: bool,
    /// Уведомлять primary о запуске secondary при `allow_secondary`.
    pub secondary_notification: bool,
    pub exclude_version: bool,
    pub exclude_path: bool,
    /// Разрешить процессу продолжить работу в роли secondary.
    pub allow_secondary: bool,
    /// Права на сегмент и сокет; `None` выводится из `user_scope`.
    pub access: Option<AccessMode>,
    /// Имя пользователя; `None` берётся из системы.
    pub user: Option<String>,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            user_scope: false,
            secondary_notification: false,
            exclude_version: false,
            exclude_path: false,
            allow_secondary: false,
            access: None,
            user: None,
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl InstanceOptions {
    pub fn access_mode(&self) -> AccessMode {
        self.access.unwrap_or(if self.user_scope {
            AccessMode::User
        } else {
            AccessMode::World
        })
    }
}

enum Role {
    Primary {
        listener: LocalListener,
    },
    Secondary {
        instance_number: u32,
        connector: Mutex<LocalConnector>,
    },
}

/// Единственный экземпляр приложения: результат выборов и всё, что к нему
/// прилагается (сегмент, слушатель или подключение к primary).
///
/// Primary при уничтожении останавливает слушатель и освобождает имя.
pub struct SingleInstance {
    name: String,
    block: SharedBlock,
    role: Role,
    timeout: Duration,
}

impl SingleInstance {
    pub fn start(
        identity: &AppIdentity,
        handler: Arc<dyn InstanceHandler>,
        options: InstanceOptions,
    ) -> Result<Self> {
        let user = options.user.clone().unwrap_or_else(current_user);
        let name = block_server_name(
            identity,
            &NameOptions {
                exclude_version: options.exclude_version,
                exclude_path: options.exclude_path,
                user: options.user_scope.then(|| user.clone()),
            },
        );
        Self::start_named(&name, &user, handler, options)
    }

    /// Запуск с готовым именем точки встречи.
    pub fn start_named(
        name: &str,
        user: &str,
        handler: Arc<dyn InstanceHandler>,
        options: InstanceOptions,
    ) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name.contains('\0') {
            return Err(SingleError::InvalidName);
        }

        let access = options.access_mode();
        let context = ServerContext {
            server_name: name.to_owned(),
            secondary_notification: options.secondary_notification,
        };
        let poll_interval = options.poll_interval;
        let elected = election::elect(name, access, user, || {
            LocalListener::start(name, access, context, handler, poll_interval)
        })?;

        let role = match elected.outcome {
            Outcome::Primary(listener) => Role::Primary { listener },
            Outcome::Secondary { instance_number } => {
                let mut connector = LocalConnector::new(name, instance_number);
                if !options.allow_secondary {
                    connector.connect(options.timeout, ConnectionType::NewInstance)?;
                } else if options.secondary_notification {
                    if let Err(err) =
                        connector.connect(options.timeout, ConnectionType::SecondaryInstance)
                    {
                        warn!(%err, instance_number, "could not notify primary");
                    }
                }
                Role::Secondary {
                    instance_number,
                    connector: Mutex::new(connector),
                }
            }
        };

        info!(
            name,
            primary = matches!(role, Role::Primary { .. }),
            "single instance started"
        );
        Ok(Self {
            name: name.to_owned(),
            block: elected.block,
            role,
            timeout: options.timeout,
        })
    }

    pub fn is_primary(&self) -> bool {
        matches!(self.role, Role::Primary { .. })
    }

    pub fn is_secondary(&self) -> bool {
        !self.is_primary()
    }

    /// Номер secondary; у primary всегда 0.
    pub fn instance_id(&self) -> u32 {
        match self.role {
            Role::Primary { .. } => 0,
            Role::Secondary {
                instance_number, ..
            } => instance_number,
        }
    }

    pub fn block_server_name(&self) -> &str {
        &self.name
    }

    pub fn primary_pid(&self) -> Result<i64> {
        self.block.primary_pid()
    }

    pub fn primary_user(&self) -> Result<String> {
        self.block.primary_user()
    }

    /// Отправка данных primary с таймаутом по умолчанию.
    pub fn send_message(&self, payload: &[u8]) -> Result<()> {
        self.send_message_timeout(payload, self.timeout)
    }

    /// Отправка данных primary. Если соединения ещё нет (или оно разорвано),
    /// сначала выполняется подключение с типом `Reconnect`.
    pub fn send_message_timeout(&self, payload: &[u8], timeout: Duration) -> Result<()> {
        let Role::Secondary { connector, .. } = &self.role else {
            return Err(SingleError::NotSecondary);
        };
        let mut connector = connector.lock().unwrap_or_else(PoisonError::into_inner);
        connector.connect(timeout, ConnectionType::Reconnect)?;
        connector.send_message(payload, timeout)
    }
}

impl Drop for SingleInstance {
    fn drop(&mut self) {
        match &self.role {
            Role::Primary { listener } => {
                listener.stop();
                if let Err(err) = election::retire(&self.block) {
                    warn!(%err, name = %self.name, "failed to release shared block");
                }
            }
            Role::Secondary { connector, .. } => {
                connector
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .disconnect();
            }
        }
    }
}
