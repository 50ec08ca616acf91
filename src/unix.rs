//! Platform layer - POSIX shared memory, flock и poll через libc.
//!
//! Сегмент создаётся `shm_open(O_CREAT | O_EXCL)`: успешное создание и есть
//! право стать primary. Блокировка блока - `flock` на дескрипторе сегмента;
//! ядро снимает её при смерти процесса.

use std::ffi::{CStr, CString};
use std::marker::PhantomData;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::ptr::{null_mut, NonNull};
use std::time::Duration;

use crate::error::{Result, SingleError};

// ============================================================================
// Access mode
// ============================================================================

/// Кто может подключиться к сегменту и сокету.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Любой пользователь хоста.
    #[default]
    World,
    /// Только текущий пользователь.
    User,
}

impl AccessMode {
    pub fn file_mode(self) -> u32 {
        match self {
            AccessMode::World => 0o666,
            AccessMode::User => 0o600,
        }
    }
}

fn to_cstring(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| SingleError::InvalidName)
}

fn errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

// ============================================================================
// ShmHandle - именованный объект POSIX shm
// ============================================================================

#[derive(Debug)]
pub struct ShmHandle {
    fd: OwnedFd,
    name: String,
}

impl ShmHandle {
    /// Эксклюзивное создание; `AlreadyExists`, если имя занято.
    pub fn create(name: &str, mode: AccessMode) -> Result<Self> {
        let c_name = to_cstring(name)?;
        let fd = unsafe {
            libc::shm_open(
                c_name.as_ptr(),
                libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                mode.file_mode() as libc::c_uint,
            )
        };
        if fd < 0 {
            return match errno() {
                libc::EEXIST => Err(SingleError::AlreadyExists),
                _ => Err(SingleError::last_os("shm_open(create)")),
            };
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // umask мог урезать права
        if unsafe { libc::fchmod(fd.as_raw_fd(), mode.file_mode() as libc::mode_t) } != 0 {
            let err = SingleError::last_os("fchmod");
            let _ = Self::unlink(name);
            return Err(err);
        }

        Ok(Self {
            fd,
            name: name.to_owned(),
        })
    }

    /// Открытие существующего объекта; `NotFound`, если его уже нет.
    pub fn open(name: &str) -> Result<Self> {
        let c_name = to_cstring(name)?;
        let fd = unsafe { libc::shm_open(c_name.as_ptr(), libc::O_RDWR, 0 as libc::c_uint) };
        if fd < 0 {
            return match errno() {
                libc::ENOENT => Err(SingleError::NotFound),
                _ => Err(SingleError::last_os("shm_open(attach)")),
            };
        }
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            name: name.to_owned(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Эксклюзивная блокировка сегмента (блокирующая).
    pub fn lock(&self) -> Result<FileLock<'_>> {
        loop {
            let rc = unsafe { libc::flock(self.fd.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(FileLock {
                    fd: self.fd.as_raw_fd(),
                    _owner: PhantomData,
                });
            }
            if errno() != libc::EINTR {
                return Err(SingleError::last_os("flock"));
            }
        }
    }

    fn stat(&self) -> Result<libc::stat> {
        let mut stat: libc::stat = unsafe { std::mem::zeroed() };
        if unsafe { libc::fstat(self.fd.as_raw_fd(), &mut stat) } != 0 {
            return Err(SingleError::last_os("fstat"));
        }
        Ok(stat)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.stat()?.st_size as usize)
    }

    /// Имя всё ещё указывает на этот объект, а не на созданный заново.
    pub fn is_current(&self) -> Result<bool> {
        let current = match Self::open(&self.name) {
            Ok(handle) => handle,
            Err(SingleError::NotFound) => return Ok(false),
            Err(err) => return Err(err),
        };
        let (ours, named) = (self.stat()?, current.stat()?);
        Ok(ours.st_dev == named.st_dev && ours.st_ino == named.st_ino)
    }

    /// Удаляет имя, только если оно указывает на этот объект.
    ///
    /// Вызывать под `lock()`: все, кто удаляет имя, делают это под
    /// блокировкой своего объекта, поэтому между проверкой и unlink имя не
    /// может смениться.
    pub fn unlink_if_current(&self) -> Result<bool> {
        if !self.is_current()? {
            return Ok(false);
        }
        Self::unlink(&self.name)?;
        Ok(true)
    }

    pub fn set_len(&self, len: usize) -> Result<()> {
        if unsafe { libc::ftruncate(self.fd.as_raw_fd(), len as libc::off_t) } != 0 {
            return Err(SingleError::last_os("ftruncate"));
        }
        Ok(())
    }

    pub fn map(&self, len: usize) -> Result<Mapping> {
        let ptr = unsafe {
            libc::mmap(
                null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.fd.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(SingleError::last_os("mmap"));
        }
        let ptr = NonNull::new(ptr as *mut u8).ok_or(SingleError::Os {
            code: 0,
            context: "mmap",
        })?;
        Ok(Mapping { ptr, len })
    }

    /// Удаляет имя; отсутствие имени ошибкой не считается.
    pub fn unlink(name: &str) -> Result<()> {
        let c_name = to_cstring(name)?;
        if unsafe { libc::shm_unlink(c_name.as_ptr()) } != 0 && errno() != libc::ENOENT {
            return Err(SingleError::last_os("shm_unlink"));
        }
        Ok(())
    }
}

// ============================================================================
// FileLock
// ============================================================================

/// Держит `flock` до drop.
pub struct FileLock<'a> {
    fd: RawFd,
    _owner: PhantomData<&'a ShmHandle>,
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::flock(self.fd, libc::LOCK_UN);
        }
    }
}

// ============================================================================
// Mapping
// ============================================================================

#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        unsafe {
            let _ = libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// ============================================================================
// poll
// ============================================================================

/// Ждёт готовности к чтению любого из дескрипторов.
///
/// Возвращает флаги готовности в порядке `fds`; закрытие и ошибка тоже
/// считаются готовностью, чтобы вызывающий увидел EOF.
pub fn poll_readable(fds: &[RawFd], timeout: Duration) -> Result<Vec<bool>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;

    let rc = unsafe {
        libc::poll(
            pollfds.as_mut_ptr(),
            pollfds.len() as libc::nfds_t,
            timeout_ms,
        )
    };
    if rc < 0 {
        if errno() == libc::EINTR {
            return Ok(vec![false; fds.len()]);
        }
        return Err(SingleError::last_os("poll"));
    }

    Ok(pollfds
        .iter()
        .map(|p| p.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0)
        .collect())
}

// ============================================================================
// connect с ограничением по времени
// ============================================================================

fn set_nonblocking(fd: RawFd, on: bool) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(SingleError::last_os("fcntl(F_GETFL)"));
    }
    let flags = if on {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags) } != 0 {
        return Err(SingleError::last_os("fcntl(F_SETFL)"));
    }
    Ok(())
}

/// Подключение к Unix-сокету, которое не ждёт дольше `timeout`.
///
/// Блокирующий `connect` к слушателю с полной очередью ждёт без срока,
/// поэтому сокет подключается в неблокирующем режиме. Linux в этом случае
/// сразу отдаёт `EAGAIN` (это `Timeout` для вызывающего, он повторит попытку),
/// другие системы отдают `EINPROGRESS`, и тогда ждём записи через `poll`.
/// Готовый поток возвращается в блокирующем режиме.
pub fn connect_unix(path: &Path, timeout: Duration) -> Result<UnixStream> {
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() || bytes.contains(&0) {
        return Err(SingleError::InvalidName);
    }
    for (dst, &src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = src as libc::c_char;
    }

    let raw = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM, 0) };
    if raw < 0 {
        return Err(SingleError::last_os("socket"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(raw) };
    if unsafe { libc::fcntl(raw, libc::F_SETFD, libc::FD_CLOEXEC) } != 0 {
        return Err(SingleError::last_os("fcntl(F_SETFD)"));
    }
    set_nonblocking(raw, true)?;

    let rc = unsafe {
        libc::connect(
            raw,
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t,
        )
    };
    if rc != 0 {
        match errno() {
            libc::EINPROGRESS | libc::EINTR => wait_connected(raw, timeout)?,
            libc::EAGAIN => return Err(SingleError::Timeout),
            _ => return Err(SingleError::last_os("connect")),
        }
    }

    set_nonblocking(raw, false)?;
    Ok(UnixStream::from(fd))
}

fn wait_connected(fd: RawFd, timeout: Duration) -> Result<()> {
    let mut pollfd = libc::pollfd {
        fd,
        events: libc::POLLOUT,
        revents: 0,
    };
    let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    let rc = unsafe { libc::poll(&mut pollfd, 1, timeout_ms) };
    if rc < 0 {
        return Err(SingleError::last_os("poll(connect)"));
    }
    if rc == 0 {
        return Err(SingleError::Timeout);
    }

    let mut so_error: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut so_error as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(SingleError::last_os("getsockopt(SO_ERROR)"));
    }
    if so_error != 0 {
        return Err(SingleError::Os {
            code: so_error,
            context: "connect",
        });
    }
    Ok(())
}

// ============================================================================
// send без SIGPIPE
// ============================================================================

#[cfg(any(target_os = "linux", target_os = "android"))]
const SEND_FLAGS: libc::c_int = libc::MSG_NOSIGNAL;
#[cfg(not(any(target_os = "linux", target_os = "android")))]
const SEND_FLAGS: libc::c_int = 0;

/// Пишет буфер целиком; закрытый сокет даёт `EPIPE`, а не сигнал.
pub fn send_all(fd: RawFd, mut buf: &[u8]) -> std::io::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe {
            libc::send(
                fd,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                SEND_FLAGS,
            )
        };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        if rc == 0 {
            return Err(std::io::ErrorKind::WriteZero.into());
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}

// ============================================================================
// Process identity
// ============================================================================

pub fn process_id() -> i64 {
    std::process::id() as i64
}

/// Имя эффективного пользователя; при неудаче - `$USER`.
pub fn current_user() -> String {
    let uid = unsafe { libc::geteuid() };
    let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
    let mut buf = vec![0 as libc::c_char; 1024];
    let mut result: *mut libc::passwd = null_mut();

    let rc = unsafe { libc::getpwuid_r(uid, &mut pwd, buf.as_mut_ptr(), buf.len(), &mut result) };
    if rc == 0 && !result.is_null() && !pwd.pw_name.is_null() {
        let name = unsafe { CStr::from_ptr(pwd.pw_name) }
            .to_string_lossy()
            .into_owned();
        if !name.is_empty() {
            return name;
        }
    }
    std::env::var("USER").unwrap_or_default()
}
