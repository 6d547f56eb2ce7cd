use {
    async_trait::async_trait,
    clap::Parser,
    log::info,
    wsfs::{
        config::DEFAULT_BUFFER_CAPACITY,
        srv::{Filesystem, Responder, srv_async},
        *,
    },
};

// Commands are logged by the server as they are decoded. Only the commands
// that carry no state answer Ok; everything else answers NotSupport.
struct TraceFs;

#[async_trait]
impl Filesystem for TraceFs {
    async fn close(&self, rsp: &Responder, _fd: u32) -> Result<()> {
        rsp.status(Status::Ok).await
    }

    async fn sync(&self, rsp: &Responder, _fd: u32) -> Result<()> {
        rsp.status(Status::Ok).await
    }
}

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address
    /// where: proto = tcp | unix
    address: String,

    /// Capacity of each pooled buffer
    #[arg(long, default_value_t = DEFAULT_BUFFER_CAPACITY)]
    buffer_capacity: usize,

    /// Released buffers kept for reuse
    #[arg(long, default_value_t = 256)]
    max_idle_buffers: usize,

    /// Largest record accepted
    #[arg(long, default_value_t = 64 * 1024)]
    max_frame_length: usize,

    /// Handlers allowed to run at once per connection
    #[arg(long)]
    max_in_flight: Option<usize>,
}

impl Cli {
    fn config(&self) -> ServerConfig {
        ServerConfig::new()
            .buffer_capacity(self.buffer_capacity)
            .max_idle_buffers(self.max_idle_buffers)
            .max_frame_length(self.max_frame_length)
            .max_in_flight(self.max_in_flight)
    }
}

async fn trace_main(cli: Cli) -> wsfs::Result<i32> {
    let config = cli.config();
    info!("[*] {:?}", config);
    info!("[*] Ready to accept clients: {}", cli.address);

    srv_async(TraceFs, &cli.address, config).await.and(Ok(0))
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = trace_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_library() {
        let cli = Cli::try_parse_from(["wsfs-trace", "tcp!127.0.0.1:7070"]).unwrap();
        let config = cli.config();
        let default = ServerConfig::default();

        assert_eq!(config.buffer_capacity, default.buffer_capacity);
        assert_eq!(config.max_idle_buffers, default.max_idle_buffers);
        assert_eq!(config.max_frame_length, default.max_frame_length);
        assert_eq!(config.max_in_flight, None);
    }

    #[test]
    fn limits_from_flags() {
        let cli = Cli::try_parse_from([
            "wsfs-trace",
            "unix!/tmp/wsfs.sock",
            "--buffer-capacity",
            "1",
            "--max-in-flight",
            "8",
        ])
        .unwrap();
        let config = cli.config();

        assert_eq!(cli.address, "unix!/tmp/wsfs.sock");
        assert_eq!(config.buffer_capacity, RESPONSE_HEADER_SIZE);
        assert_eq!(config.max_in_flight, Some(8));
    }

    #[tokio::test]
    async fn stateless_commands_answer_ok() {
        let config = ServerConfig::default();
        let pool = config.buffer_pool();
        let (tx, mut rx) = tokio::sync::mpsc::channel(4);
        let rsp = Responder::new(3, tx, pool);

        TraceFs.close(&rsp, 1).await.unwrap();
        TraceFs.sync(&rsp, 1).await.unwrap();
        assert!(TraceFs.open(&rsp, "/", 0, 0).await.is_err());

        for _ in 0..2 {
            assert_eq!(&*rx.recv().await.unwrap(), &[3, Status::Ok as u8]);
        }
    }
}
