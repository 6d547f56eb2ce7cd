//! Server configuration.

use tokio_util::codec::length_delimited::{self, LengthDelimitedCodec};

use crate::{
    fcall::{DATA_PER_MSG, RESPONSE_HEADER_SIZE},
    pool::BufferPool,
};

/// Capacity of pooled buffers: one full data response plus its header.
pub const DEFAULT_BUFFER_CAPACITY: usize = DATA_PER_MSG + RESPONSE_HEADER_SIZE;

/// Configuration shared by every connection of a server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of each pooled buffer. Bounds both payload arguments and
    /// single responses.
    pub buffer_capacity: usize,

    /// Released buffers kept for reuse.
    pub max_idle_buffers: usize,

    /// Largest record accepted from the transport.
    pub max_frame_length: usize,

    /// Responses queued per connection before handlers wait on the writer.
    pub response_channel_size: usize,

    /// Handlers allowed to run at once per connection, `None` for no limit.
    pub max_in_flight: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            max_idle_buffers: 256,
            max_frame_length: 64 * 1024,
            response_channel_size: 1024,
            max_in_flight: None,
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pooled buffer capacity, never below a response header.
    pub fn buffer_capacity(mut self, size: usize) -> Self {
        self.buffer_capacity = size.max(RESPONSE_HEADER_SIZE);
        self
    }

    pub fn max_idle_buffers(mut self, count: usize) -> Self {
        self.max_idle_buffers = count;
        self
    }

    pub fn max_frame_length(mut self, size: usize) -> Self {
        self.max_frame_length = size;
        self
    }

    pub fn response_channel_size(mut self, size: usize) -> Self {
        self.response_channel_size = size.max(1);
        self
    }

    pub fn max_in_flight(mut self, limit: Option<usize>) -> Self {
        self.max_in_flight = limit;
        self
    }

    /// Build the buffer pool described by this configuration
    pub fn buffer_pool(&self) -> BufferPool {
        BufferPool::new(self.buffer_capacity, self.max_idle_buffers)
    }

    /// Record framing used on raw stream transports:
    /// length[4] (little endian, not counting itself) record[length]
    pub fn framing(&self) -> length_delimited::Builder {
        let mut builder = LengthDelimitedCodec::builder();
        builder
            .length_field_offset(0)
            .length_field_length(4)
            .length_adjustment(0)
            .little_endian()
            .max_frame_length(self.max_frame_length);
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_clamps() {
        let config = ServerConfig::new()
            .buffer_capacity(0)
            .response_channel_size(0)
            .max_in_flight(Some(4));
        assert_eq!(config.buffer_capacity, RESPONSE_HEADER_SIZE);
        assert_eq!(config.response_channel_size, 1);
        assert_eq!(config.max_in_flight, Some(4));
    }

    #[test]
    fn pool_follows_config() {
        let pool = ServerConfig::default().buffer_pool();
        assert_eq!(pool.capacity(), 4098);
        assert_eq!(pool.outstanding(), 0);
    }
}
