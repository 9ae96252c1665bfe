//! SFTP 传输（ssh2）
//!
//! 连接、握手、认证与写文件都是阻塞调用，由上层放进 `spawn_blocking`。
//! 套接字读写超时与 libssh2 会话超时都设为目标的 `timeout`。
//! 写入被中止时关闭远端文件并尽力删除，不留下截断的半成品。

use std::io::{self, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;

use bytes::Bytes;
use ssh2::{ErrorCode, Session, Sftp};

use super::{CHUNK_SIZE, SessionAuth, TransferAbort, Transport, TransportSession};
use crate::config::Destination;
use crate::error::AppError;

/// libssh2 的 LIBSSH2_ERROR_TIMEOUT
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

#[derive(Debug, Clone, Copy, Default)]
pub struct SftpTransport;

fn is_timeout(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT))
}

fn connection_error(context: &str, e: ssh2::Error) -> AppError {
    if is_timeout(&e) {
        AppError::TransportTimeout(format!("{}: {}", context, e))
    } else {
        AppError::TransportConnectionFailed(format!("{}: {}", context, e))
    }
}

fn auth_error(context: &str, e: ssh2::Error) -> AppError {
    if is_timeout(&e) {
        AppError::TransportTimeout(format!("{}: {}", context, e))
    } else {
        AppError::TransportAuthFailed(format!("{}: {}", context, e))
    }
}

fn io_error(context: &str, e: io::Error) -> AppError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
            AppError::TransportTimeout(format!("{}: {}", context, e))
        }
        _ => AppError::TransportConnectionFailed(format!("{}: {}", context, e)),
    }
}

fn open_tcp(destination: &Destination) -> Result<TcpStream, AppError> {
    let addrs = (destination.host.as_str(), destination.port)
        .to_socket_addrs()
        .map_err(|e| {
            AppError::TransportConnectionFailed(format!(
                "无法解析主机 '{}': {}",
                destination.host, e
            ))
        })?;

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, destination.timeout) {
            Ok(stream) => {
                stream
                    .set_read_timeout(Some(destination.timeout))
                    .and_then(|_| stream.set_write_timeout(Some(destination.timeout)))
                    .map_err(|e| io_error("设置套接字超时失败", e))?;
                return Ok(stream);
            }
            Err(e) => {
                log::debug!("连接 {} 失败: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(match last_err {
        Some(e) => io_error(
            &format!("无法连接 {}:{}", destination.host, destination.port),
            e,
        ),
        None => AppError::TransportConnectionFailed(format!(
            "主机 '{}' 没有可用地址",
            destination.host
        )),
    })
}

fn authenticate(session: &Session, username: &str, auth: &SessionAuth) -> Result<(), AppError> {
    match auth {
        SessionAuth::KeyFile { path, passphrase } => {
            if !path.is_file() {
                return Err(AppError::TransportAuthFailed(format!(
                    "私钥文件不存在: {}",
                    path.display()
                )));
            }
            session
                .userauth_pubkey_file(username, None, path, passphrase.as_ref().map(|p| p.as_str()))
                .map_err(|e| auth_error("私钥认证失败", e))?;
        }
        SessionAuth::Password(password) => {
            session
                .userauth_password(username, password.as_str())
                .map_err(|e| auth_error("密码认证失败", e))?;
        }
    }

    if !session.authenticated() {
        return Err(AppError::TransportAuthFailed(format!(
            "用户 '{}' 认证未通过",
            username
        )));
    }
    Ok(())
}

impl Transport for SftpTransport {
    fn connect(
        &self,
        destination: &Destination,
        auth: &SessionAuth,
    ) -> Result<Box<dyn TransportSession>, AppError> {
        let tcp = open_tcp(destination)?;

        let mut session =
            Session::new().map_err(|e| connection_error("创建 SSH 会话失败", e))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(destination.timeout.as_millis().min(u32::MAX as u128) as u32);
        session
            .handshake()
            .map_err(|e| connection_error("SSH 握手失败", e))?;

        authenticate(&session, &destination.username, auth)?;

        let sftp = session
            .sftp()
            .map_err(|e| connection_error("打开 SFTP 通道失败", e))?;

        log::debug!("🔐 SFTP 会话已建立: {}", destination.name);
        Ok(Box::new(SftpSession {
            _session: session,
            sftp,
        }))
    }
}

struct SftpSession {
    // 通道依赖会话存活
    _session: Session,
    sftp: Sftp,
}

impl SftpSession {
    /// 逐级创建父目录，已存在等错误一律忽略
    fn ensure_parent_dirs(&self, remote_path: &str) {
        let Some(parent) = Path::new(remote_path).parent() else {
            return;
        };
        let mut ancestors: Vec<&Path> = parent
            .ancestors()
            .filter(|p| !p.as_os_str().is_empty() && *p != Path::new("/"))
            .collect();
        ancestors.reverse();
        for dir in ancestors {
            if self.sftp.stat(dir).is_ok() {
                continue;
            }
            if let Err(e) = self.sftp.mkdir(dir, 0o755) {
                log::debug!("创建远端目录 {} 失败（忽略）: {}", dir.display(), e);
            }
        }
    }

    fn discard_partial(&self, remote_path: &str) {
        match self.sftp.unlink(Path::new(remote_path)) {
            Ok(()) => log::info!("🧹 已删除中止的远端文件 {}", remote_path),
            Err(e) => log::warn!("⚠️ 删除中止的远端文件 {} 失败: {}", remote_path, e),
        }
    }
}

impl TransportSession for SftpSession {
    fn write_file(
        &mut self,
        remote_path: &str,
        payload: &Bytes,
        abort: &TransferAbort,
        progress: &mut dyn FnMut(u64),
    ) -> Result<u64, AppError> {
        abort.checkpoint()?;
        self.ensure_parent_dirs(remote_path);

        let mut file = self
            .sftp
            .create(Path::new(remote_path))
            .map_err(|e| connection_error(&format!("创建远端文件 {} 失败", remote_path), e))?;

        let mut sent = 0u64;
        for chunk in payload.chunks(CHUNK_SIZE) {
            if let Err(e) = abort.checkpoint() {
                drop(file);
                self.discard_partial(remote_path);
                return Err(e);
            }
            file.write_all(chunk)
                .map_err(|e| io_error(&format!("写入 {} 失败", remote_path), e))?;
            sent += chunk.len() as u64;
            progress(sent);
        }
        file.flush()
            .map_err(|e| io_error(&format!("刷新 {} 失败", remote_path), e))?;

        Ok(sent)
    }
}
