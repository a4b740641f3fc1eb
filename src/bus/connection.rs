use super::transport::{ChannelConfig, ChannelInfo, I2cTransport, TransferOptions};
use super::{AddressableBus, BusConnection, ConnectionState};
use crate::error::{Direction, TransferFailure};
use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

const WRITE_OPTIONS: TransferOptions =
    TransferOptions::BREAK_ON_NACK.union(TransferOptions::FAST_TRANSFER_BYTES);
const READ_OPTIONS: TransferOptions = TransferOptions::empty();

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug)]
struct Link {
    state: ConnectionState,
    channel: Option<ChannelInfo>,
}

/// Resets the link state when dropped, also when the owning future is cancelled midway.
struct Transition<'a> {
    link: &'a Mutex<Link>,
    target: ConnectionState,
}

impl Drop for Transition<'_> {
    fn drop(&mut self) {
        let mut link = lock(self.link);
        link.state = self.target;
        if self.target == ConnectionState::Disconnected {
            link.channel = None;
        }
    }
}

struct Session<T: I2cTransport> {
    transport: T,
    handle: Option<T::Handle>,
}

impl<T: I2cTransport> Session<T> {
    fn find_channel(&mut self, serial_number: &str, channel_index: usize) -> Result<(u32, ChannelInfo)> {
        let count = self
            .transport
            .channel_count()
            .map_err(Error::DeviceEnumeration)?;
        log::debug!("transport reports {count} channels");

        let mut matching = 0;
        for index in 0..count {
            let info = self
                .transport
                .channel_info(index)
                .map_err(Error::DeviceEnumeration)?;
            if info.serial_number != serial_number {
                continue;
            }
            if matching == channel_index {
                return Ok((index, info));
            }
            matching += 1;
        }
        Err(Error::ChannelNotFound {
            serial_number: serial_number.to_owned(),
            index: channel_index,
        })
    }

    fn open(
        &mut self,
        serial_number: &str,
        channel_index: usize,
        config: &ChannelConfig,
    ) -> Result<ChannelInfo> {
        // Left over by a cancelled connect.
        if let Some(handle) = self.handle.take() {
            if let Err(status) = self.transport.close_channel(handle) {
                log::warn!("Cannot close stale channel ({status})");
            }
        }

        let (index, info) = self.find_channel(serial_number, channel_index)?;
        let mut handle = self
            .transport
            .open_channel(index)
            .map_err(Error::ChannelOpen)?;
        if let Err(status) = self.transport.init_channel(&mut handle, config) {
            if let Err(close_status) = self.transport.close_channel(handle) {
                log::warn!("Cannot close channel after failed initialization ({close_status})");
            }
            return Err(Error::ChannelInit(status));
        }
        self.handle = Some(handle);
        Ok(info)
    }

    fn close(&mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => self
                .transport
                .close_channel(handle)
                .map_err(Error::ChannelClose),
            None => Ok(()),
        }
    }
}

impl<T: I2cTransport> Drop for Session<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            log::warn!("Cannot close channel on drop ({err})");
        }
    }
}

fn write_checked<T: I2cTransport>(
    transport: &mut T,
    handle: &mut T::Handle,
    address: u8,
    data: &[u8],
    options: TransferOptions,
) -> Result<()> {
    log::trace!("write to 0x{address:02X}: {data:02X?}");
    let failure = |failure: TransferFailure| Error::Transfer {
        address,
        direction: Direction::Writing,
        failure,
    };
    let transferred = transport
        .device_write(handle, address, data, options)
        .map_err(|status| failure(TransferFailure::Status(status)))?;
    if transferred != data.len() {
        return Err(failure(TransferFailure::Incomplete {
            requested: data.len(),
            transferred,
        }));
    }
    Ok(())
}

fn read_truncated<T: I2cTransport>(
    transport: &mut T,
    handle: &mut T::Handle,
    address: u8,
    length: usize,
    options: TransferOptions,
) -> Result<Vec<u8>> {
    let mut buffer = vec![0; length];
    let transferred = transport
        .device_read(handle, address, &mut buffer, options)
        .map_err(|status| Error::Transfer {
            address,
            direction: Direction::Reading,
            failure: TransferFailure::Status(status),
        })?;
    if transferred < length {
        log::debug!("short read from 0x{address:02X}: {transferred} of {length} bytes");
        buffer.truncate(transferred);
    }
    log::trace!("read from 0x{address:02X}: {buffer:02X?}");
    Ok(buffer)
}

/// A bus session over a blocking [`I2cTransport`].
///
/// Every operation runs on the blocking thread pool while holding exclusive access to the
/// transport, so transactions of concurrent callers are serialized and never interleaved.
/// Distinct connections share nothing and run in parallel.
pub struct Connection<T: I2cTransport> {
    config: ChannelConfig,
    link: Mutex<Link>,
    session: Arc<Mutex<Session<T>>>,
}

impl<T: I2cTransport> Connection<T> {
    pub fn new(transport: T) -> Self {
        Self::with_config(transport, ChannelConfig::default())
    }

    pub fn with_config(transport: T, config: ChannelConfig) -> Self {
        Self {
            config,
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                channel: None,
            }),
            session: Arc::new(Mutex::new(Session {
                transport,
                handle: None,
            })),
        }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// The channel in use while connected.
    pub fn channel(&self) -> Option<ChannelInfo> {
        lock(&self.link).channel.clone()
    }

    async fn run<R, F>(&self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut Session<T>) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || operation(&mut lock(&session))).await?
    }

    async fn transaction<R, F>(&self, operation: F) -> Result<R>
    where
        F: FnOnce(&mut T, &mut T::Handle) -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.state() != ConnectionState::Connected {
            return Err(Error::NotConnected);
        }
        self.run(move |session| {
            let Session { transport, handle } = session;
            let handle = handle.as_mut().ok_or(Error::NotConnected)?;
            operation(transport, handle)
        })
        .await
    }
}

#[async_trait]
impl<T: I2cTransport> BusConnection for Connection<T> {
    async fn connect(&self, serial_number: &str, channel_index: usize) -> Result<()> {
        let mut transition = {
            let mut link = lock(&self.link);
            if link.state != ConnectionState::Disconnected {
                return Err(Error::InvalidState(link.state));
            }
            link.state = ConnectionState::Connecting;
            Transition {
                link: &self.link,
                target: ConnectionState::Disconnected,
            }
        };

        log::debug!("connect to channel {channel_index} of device '{serial_number}'");
        let config = self.config;
        let serial_number = serial_number.to_owned();
        let info = self
            .run(move |session| session.open(&serial_number, channel_index, &config))
            .await?;

        log::debug!("connected to {info:?}");
        lock(&self.link).channel = Some(info);
        transition.target = ConnectionState::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let (_transition, stale) = {
            let mut link = lock(&self.link);
            let stale = match link.state {
                ConnectionState::Disconnected => {
                    // A cancelled connect may have opened a channel after all. A session
                    // still locked belongs to a running open, which the next connect reclaims.
                    let stale = self
                        .session
                        .try_lock()
                        .ok()
                        .and_then(|mut session| session.handle.take());
                    if stale.is_none() {
                        return Ok(());
                    }
                    stale
                }
                ConnectionState::Connected => None,
                other => return Err(Error::InvalidState(other)),
            };
            link.state = ConnectionState::Disconnecting;
            let transition = Transition {
                link: &self.link,
                target: ConnectionState::Disconnected,
            };
            (transition, stale)
        };

        log::debug!("disconnect");
        let result = self
            .run(move |session| match stale {
                Some(handle) => {
                    log::debug!("closing channel left by a cancelled connect");
                    session
                        .transport
                        .close_channel(handle)
                        .map_err(Error::ChannelClose)
                }
                None => session.close(),
            })
            .await;
        if let Err(err) = &result {
            log::warn!("Error during disconnect: {err}");
        }
        result
    }

    fn state(&self) -> ConnectionState {
        lock(&self.link).state
    }
}

#[async_trait]
impl<T: I2cTransport> AddressableBus for Connection<T> {
    async fn send(&self, address: u8, data: &[u8]) -> Result<()> {
        let data = data.to_vec();
        self.transaction(move |transport, handle| {
            let options = WRITE_OPTIONS | TransferOptions::START_BIT | TransferOptions::STOP_BIT;
            write_checked(transport, handle, address, &data, options)
        })
        .await
    }

    async fn receive(&self, address: u8, length: usize) -> Result<Vec<u8>> {
        if length == 0 {
            return Err(Error::InvalidArgument("receive length must be positive"));
        }
        self.transaction(move |transport, handle| {
            let options = READ_OPTIONS | TransferOptions::START_BIT | TransferOptions::STOP_BIT;
            read_truncated(transport, handle, address, length, options)
        })
        .await
    }

    async fn transceive(
        &self,
        address: u8,
        data: &[u8],
        receive_length: usize,
    ) -> Result<Vec<u8>> {
        if data.is_empty() {
            return Err(Error::InvalidArgument("transceive payload must not be empty"));
        }
        if receive_length == 0 {
            return Err(Error::InvalidArgument("receive length must be positive"));
        }
        let data = data.to_vec();
        self.transaction(move |transport, handle| {
            write_checked(
                transport,
                handle,
                address,
                &data,
                WRITE_OPTIONS | TransferOptions::START_BIT,
            )?;
            read_truncated(
                transport,
                handle,
                address,
                receive_length,
                READ_OPTIONS
                    | TransferOptions::START_BIT
                    | TransferOptions::STOP_BIT
                    | TransferOptions::NACK_LAST_BYTE,
            )
        })
        .await
    }
}

impl<T: I2cTransport> std::fmt::Debug for Connection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("link", &*lock(&self.link))
            .finish_non_exhaustive()
    }
}
