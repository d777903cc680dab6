use std::{
    fs::File,
    io::Read,
    path::PathBuf,
    process,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use clap::Parser;
use dtm0::{
    clock::ClockSource,
    common::ParticipantId,
    config::ClusterConfig,
    dtx::Dtx,
    health::{Ha, HaState},
    log::{Log, PersistentLog, VolatileLog},
    message::{Message, MessageKind},
    service::Dtm0Service,
    transport::simulated::Transport,
    Error, Result,
};
use tokio::{runtime, time::sleep};
use tracing::{info, warn, Span};

type Server = Dtm0Service<Transport, PersistentLog>;
type Client = Dtm0Service<Transport, VolatileLog>;

#[derive(Parser, Debug)]
#[clap(name = "DTM0 Simulation", version)]
struct Args {
    #[clap(short, long, default_value_t = 3)]
    durable: u64,
    #[clap(short, long, default_value_t = 1)]
    volatile: u64,
    #[clap(short = 'n', long = "tx", default_value_t = 100)]
    n_transaction: usize,
    /// Cluster file; overrides --durable and --volatile
    #[clap(short, long, parse(from_os_str))]
    config: Option<PathBuf>,
}

fn main() {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let shutdown = Arc::new(AtomicBool::new(false));
    ctrlc::set_handler({
        let shutdown = shutdown.clone();
        move || {
            println!();
            if !shutdown.load(Ordering::SeqCst) {
                shutdown.store(true, Ordering::SeqCst);
            } else {
                warn!("double ctrl-c, quit ungracefully");
                process::abort();
            }
        }
    })
    .unwrap();

    let runtime = runtime::Builder::new_multi_thread()
        .enable_time()
        .build()
        .unwrap();
    if let Err(err) = runtime.block_on(run(args, shutdown)) {
        eprintln!("dtm0-sim: {}", err);
        process::exit(1);
    }
}

fn cluster_config(args: &Args) -> Result<ClusterConfig> {
    if let Some(path) = &args.config {
        let mut buf = String::new();
        File::open(path)
            .and_then(|mut file| file.read_to_string(&mut buf))
            .map_err(|err| Error::Config(format!("{}: {}", path.display(), err)))?;
        return buf.parse();
    }
    let mut config = ClusterConfig::default();
    for i in 0..args.durable {
        let id = ParticipantId(i + 1);
        config.push_participant(id, format!("replica-{}", i), false);
        config.map_service(1000 + i, id);
    }
    for i in 0..args.volatile {
        let label = char::from_u32('A' as u32 + i as u32).unwrap_or('?');
        config.push_participant(ParticipantId(100 + i), format!("client-{}", label), true);
    }
    Ok(config)
}

async fn run(args: Args, shutdown: Arc<AtomicBool>) -> Result<()> {
    let config = Arc::new(cluster_config(&args)?);
    let ha = Arc::new(Ha::new());
    for participant in &config.participants {
        ha.set_state(participant.id, HaState::Online);
    }

    let mut transport = Transport::new();
    transport.insert_filter(
        1,
        Transport::delay(Duration::from_micros(10), Duration::from_micros(100)),
    );
    let mut server_list = Vec::new();
    let mut client_list = Vec::new();
    for participant in &config.participants {
        if participant.volatile {
            let log = Arc::new(VolatileLog::new());
            client_list.push(Client::register_new(
                &mut transport,
                participant.id,
                config.clone(),
                log,
                ha.clone(),
            )?);
        } else {
            let log = Arc::new(PersistentLog::open_in_memory()?);
            server_list.push(Server::register_new(
                &mut transport,
                participant.id,
                config.clone(),
                log,
                ha.clone(),
            )?);
        }
    }
    if server_list.is_empty() || client_list.is_empty() {
        return Err(Error::Config(
            "need at least one durable and one volatile participant".to_string(),
        ));
    }
    for service in &server_list {
        service.start();
    }
    for service in &client_list {
        service.start();
    }

    let n_done = transport
        .deliver_until(run_transactions(
            &args,
            &config,
            &server_list,
            &client_list,
            &shutdown,
        ))
        .await?;
    info!("{} transactions done", n_done);

    if !shutdown.load(Ordering::SeqCst) {
        // replace the first server with an empty one and let it catch up
        let old = server_list.remove(0);
        let id = old.local();
        transport.deliver_until(old.stop()).await;
        let log = Arc::new(PersistentLog::open_in_memory()?);
        let restarted = Server::register_new(&mut transport, id, config.clone(), log, ha.clone())?;
        ha.set_state(id, HaState::Recovering);
        restarted.start();
        let recovered = transport
            .deliver_until(async {
                for _ in 0..10000 {
                    if ha.state(id) == HaState::Online || shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    sleep(Duration::from_millis(1)).await;
                }
                ha.state(id) == HaState::Online
            })
            .await;
        if recovered {
            info!("{} recovered {} records", id, restarted.log().len());
        } else {
            warn!("{} did not recover", id);
        }
        server_list.insert(0, restarted);
    }

    for service in &client_list {
        for line in service.link().latency_report() {
            println!("{}", line);
        }
    }
    for service in &server_list {
        transport.deliver_until(service.stop()).await;
    }
    for service in &client_list {
        transport.deliver_until(service.stop()).await;
    }
    Ok(())
}

/// Closed loop: every client in turn writes one transaction to every server
/// and waits for it to become stable.
async fn run_transactions(
    args: &Args,
    config: &Arc<ClusterConfig>,
    server_list: &[Arc<Server>],
    client_list: &[Arc<Client>],
    shutdown: &AtomicBool,
) -> Result<usize> {
    let clock = Arc::new(ClockSource::physical());
    let mut n_done = 0;
    while n_done < args.n_transaction && !shutdown.load(Ordering::SeqCst) {
        let client = &client_list[n_done % client_list.len()];
        let mut dtx = Dtx::new(client.log().clone(), clock.clone(), config.clone(), client.local());
        dtx.open(server_list.len())?;
        for (index, server) in server_list.iter().enumerate() {
            dtx.assign_participant(index, config.service_of(server.local())?)?;
        }
        let payload = format!("put {}", n_done).into_bytes();
        dtx.close(Some(payload.clone()))?;

        for (index, server) in server_list.iter().enumerate() {
            let reply = client
                .link()
                .post(
                    Message::execute(dtx.copy_txd(), payload.clone()),
                    server.local(),
                    &Span::current(),
                    true,
                )
                .await?;
            match reply {
                Some(reply) if reply.kind == MessageKind::Executed => dtx.mark_executed(index)?,
                _ => return Err(Error::protocol("no EXECUTED reply")),
            }
        }
        for server in server_list {
            let record = server.log().find(&dtx.tid())?;
            server.on_committed(&record.txd)?;
        }
        dtx.wait_stable().await?;
        dtx.finalize()?;
        client.log().prune_now(&dtx.tid())?;
        n_done += 1;
    }
    Ok(n_done)
}
