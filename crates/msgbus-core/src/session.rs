//! One connection plus one channel, scoped to a single adapter call

use msgbus_transport::{Channel, Connection, Transport};
use msgbus_types::Result;
use tracing::warn;

pub(crate) struct Session {
    connection: Box<dyn Connection>,
    channel: Box<dyn Channel>,
}

impl Session {
    /// Connect and open a channel; the connection is closed again if the
    /// channel cannot be opened.
    pub(crate) async fn open(transport: &dyn Transport) -> Result<Self> {
        let connection = transport.connect().await?;
        match connection.create_channel().await {
            Ok(channel) => Ok(Self {
                connection,
                channel,
            }),
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    warn!(error = %close_err, "Failed to close connection after channel error");
                }
                Err(err)
            }
        }
    }

    pub(crate) fn channel(&self) -> &dyn Channel {
        self.channel.as_ref()
    }

    /// Release channel and connection, then hand back `result`.
    ///
    /// Release failures are logged; they never replace the outcome of the
    /// operation itself.
    pub(crate) async fn finish<T>(self, result: Result<T>) -> Result<T> {
        if let Err(err) = self.channel.close().await {
            warn!(error = %err, "Failed to close channel");
        }
        if let Err(err) = self.connection.close().await {
            warn!(error = %err, "Failed to close connection");
        }
        result
    }
}
