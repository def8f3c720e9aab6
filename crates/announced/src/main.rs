use clap::Parser;
use std::collections::HashSet;
use std::env;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::process;
use std::str::FromStr;
use std::time::Instant;
use tokio::net::UdpSocket;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use mdns_core::entry::ServiceSpec;
use mdns_core::event::{
    BrowserEvent, BrowserItem, EntryGroupId, IfIndex, Protocol, ResolverEvent, ServerEvent,
};
use mdns_core::server::{Server, ServerConfig};
use mdns_types::txt::TxtList;

mod net;

/// A `name:type:port[:key=value...]` service description from the
/// command line.
#[derive(Debug, Clone)]
struct PublishSpec {
    name: String,
    service_type: String,
    port: u16,
    txt: TxtList,
}

impl FromStr for PublishSpec {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(':');
        let name = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or("missing service name")?;
        let service_type = parts
            .next()
            .filter(|p| !p.is_empty())
            .ok_or("missing service type")?;
        let port = parts
            .next()
            .ok_or("missing port")?
            .parse::<u16>()
            .map_err(|_| "port must be a number".to_string())?;

        let mut txt = TxtList::new();
        for pair in parts {
            match pair.split_once('=') {
                Some((key, value)) => txt
                    .push_pair(key, value.as_bytes())
                    .map_err(|e| e.to_string())?,
                None => txt
                    .push(pair.as_bytes().to_vec().into())
                    .map_err(|e| e.to_string())?,
            }
        }

        Ok(Self {
            name: name.to_string(),
            service_type: service_type.to_string(),
            port,
            txt,
        })
    }
}

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

fn default_host_name() -> String {
    env::var("HOSTNAME")
        .ok()
        .and_then(|name| name.split('.').next().map(str::to_string))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "announced".to_string())
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// A small mDNS / DNS-SD responder for the local link.
///
/// announced publishes this machine's host name and any services
/// given with --publish, answers queries from other hosts, and can
/// browse for services with --browse.
///
/// It does not read configuration files: everything is on the
/// command line.
#[derive(Clone)]
struct Args {
    /// IPv4 address of the interface to announce on
    #[clap(short, long, value_parser)]
    address: Ipv4Addr,

    /// IPv6 address of the same interface; enables IPv6 announcements
    /// when given together with --ipv6-index
    #[clap(long, value_parser, requires = "ipv6_index")]
    ipv6_address: Option<Ipv6Addr>,

    /// OS index of the interface, for the IPv6 group membership
    #[clap(long, value_parser, requires = "ipv6_address")]
    ipv6_index: Option<u32>,

    /// Host name to claim, a single label without dots
    #[clap(short = 'n', long, value_parser, default_value_t = default_host_name())]
    host_name: String,

    /// Publish a service, as name:type:port[:key=value...]; can be
    /// given more than once
    #[clap(short, long, value_parser)]
    publish: Vec<PublishSpec>,

    /// Browse for instances of a service type, e.g. _ipp._tcp
    #[clap(short, long, value_parser)]
    browse: Vec<String>,

    /// Resolve browsed services to host, address, and port
    #[clap(short, long, action(clap::ArgAction::SetTrue))]
    resolve: bool,
}

/// Push everything the engine wants to send, and log everything it
/// wants to tell us.
async fn drain(
    server: &mut Server,
    socket_v4: &UdpSocket,
    socket_v6: Option<&UdpSocket>,
    args: &Args,
    now: Instant,
) {
    while let Some(transmit) = server.poll_transmit() {
        let (socket, dest) = match transmit.proto {
            Protocol::V4 => (socket_v4, transmit.dest.unwrap_or_else(net::group_addr_v4)),
            Protocol::V6 => match socket_v6 {
                Some(socket) => (socket, transmit.dest.unwrap_or_else(net::group_addr_v6)),
                None => continue,
            },
        };
        if let Err(error) = socket.send_to(&transmit.octets, dest).await {
            tracing::warn!(?dest, ?error, "send failed");
        }
    }

    while let Some(event) = server.poll_event() {
        match event {
            ServerEvent::EntryGroup { group, state } => {
                tracing::info!(?group, ?state, "entry group state");
            }
            ServerEvent::HostNameChanged { name } => {
                tracing::warn!(%name, "host name collision, renamed");
            }
            ServerEvent::Browser { event, .. } => match event {
                BrowserEvent::New(item) => {
                    log_item("new", &item);
                    if args.resolve {
                        if let BrowserItem::Service {
                            name, service_type, ..
                        } = &item
                        {
                            if let Err(error) = server.service_resolver_new(
                                name,
                                service_type,
                                None,
                                None,
                                None,
                                now,
                            ) {
                                tracing::warn!(%name, %error, "could not start resolver");
                            }
                        }
                    }
                }
                BrowserEvent::Remove(item) => log_item("gone", &item),
                BrowserEvent::AllForNow => tracing::debug!("all for now"),
                BrowserEvent::CacheExhausted => tracing::debug!("cache exhausted"),
            },
            ServerEvent::Resolver { event, .. } => match event {
                ResolverEvent::ServiceFound(service) => {
                    tracing::info!(
                        name = %service.name,
                        service_type = %service.service_type,
                        host = %service.host,
                        address = %service.address,
                        port = %service.port,
                        txt = %service.txt,
                        "resolved"
                    );
                }
                ResolverEvent::HostNameFound { name, address } => {
                    tracing::info!(%name, %address, "resolved host");
                }
                ResolverEvent::AddressFound { address, name } => {
                    tracing::info!(%address, %name, "resolved address");
                }
                ResolverEvent::Timeout => tracing::info!("resolver timed out"),
            },
        }
    }
}

fn log_item(verb: &str, item: &BrowserItem) {
    match item {
        BrowserItem::Record(rr) => tracing::info!(record = %rr, "{verb}: record"),
        BrowserItem::Service {
            name,
            service_type,
            domain,
        } => {
            tracing::info!(%name, %service_type, %domain, "{verb}: service");
        }
        BrowserItem::ServiceType {
            service_type,
            domain,
        } => {
            tracing::info!(%service_type, %domain, "{verb}: service type");
        }
        BrowserItem::Domain(domain) => tracing::info!(%domain, "{verb}: domain"),
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// Receive on a socket that may not exist; absent sockets never
/// become ready.
async fn recv_or_pend(
    socket: Option<&UdpSocket>,
    buf: &mut [u8],
) -> std::io::Result<(usize, SocketAddr)> {
    match socket {
        Some(socket) => socket.recv_from(buf).await,
        None => std::future::pending().await,
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let config = ServerConfig {
        host_name: args.host_name.clone(),
        ..ServerConfig::default()
    };
    let mut server = match Server::new(config) {
        Ok(server) => server,
        Err(error) => {
            tracing::error!(%error, "invalid configuration");
            process::exit(1);
        }
    };

    let iface = IfIndex(1);
    let now = Instant::now();
    if let Err(error) =
        server.interface_added(iface, Protocol::V4, IpAddr::V4(args.address), now)
    {
        tracing::error!(%error, "could not register interface");
        process::exit(1);
    }
    if let Some(ipv6_address) = args.ipv6_address {
        if let Err(error) =
            server.interface_added(iface, Protocol::V6, IpAddr::V6(ipv6_address), now)
        {
            tracing::error!(%error, "could not register IPv6 interface");
            process::exit(1);
        }
    }

    let mut groups: Vec<EntryGroupId> = Vec::new();
    for spec in &args.publish {
        let group = match server.entry_group_new() {
            Ok(group) => group,
            Err(error) => {
                tracing::error!(%error, "could not create entry group");
                process::exit(1);
            }
        };
        let service = ServiceSpec {
            name: spec.name.clone(),
            service_type: spec.service_type.clone(),
            domain: None,
            host: None,
            port: spec.port,
            txt: spec.txt.clone(),
        };
        if let Err(error) = server
            .entry_group_add_service(group, &service)
            .and_then(|()| server.entry_group_commit(group, now))
        {
            tracing::error!(name = %spec.name, %error, "could not publish service");
            process::exit(1);
        }
        tracing::info!(name = %spec.name, service_type = %spec.service_type, port = %spec.port, "publishing");
        groups.push(group);
    }

    for service_type in &args.browse {
        match server.service_browser_new(service_type, None, None, None, now) {
            Ok(_) => tracing::info!(%service_type, "browsing"),
            Err(error) => {
                tracing::error!(%service_type, %error, "could not browse");
                process::exit(1);
            }
        }
    }

    tracing::info!(address = %args.address, host_name = %server.host_name(), "binding mDNS socket");
    let socket = match net::bind_multicast_v4(args.address) {
        Ok(socket) => socket,
        Err(error) => {
            tracing::error!(?error, "could not bind mDNS socket");
            process::exit(1);
        }
    };

    let socket_v6 = match args.ipv6_index {
        Some(ipv6_index) => {
            tracing::info!(%ipv6_index, "binding IPv6 mDNS socket");
            match net::bind_multicast_v6(ipv6_index) {
                Ok(socket) => Some(socket),
                Err(error) => {
                    tracing::error!(?error, "could not bind IPv6 mDNS socket");
                    process::exit(1);
                }
            }
        }
        None => None,
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    let mut buf = vec![0u8; 9000];
    let mut buf_v6 = vec![0u8; 9000];
    loop {
        drain(&mut server, &socket, socket_v6.as_ref(), &args, Instant::now()).await;

        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((size, peer)) => {
                        server.handle_packet(iface, Protocol::V4, peer, &buf[..size], Instant::now());
                    }
                    Err(error) => tracing::debug!(?error, "receive error"),
                }
            }

            result = recv_or_pend(socket_v6.as_ref(), &mut buf_v6) => {
                match result {
                    Ok((size, peer)) => {
                        server.handle_packet(iface, Protocol::V6, peer, &buf_v6[..size], Instant::now());
                    }
                    Err(error) => tracing::debug!(?error, "IPv6 receive error"),
                }
            }

            () = wait_until(server.next_timeout()) => {
                server.handle_timeout(Instant::now());
            }

            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted, withdrawing services");
                break;
            }

            _ = sigterm.recv() => {
                tracing::info!("terminated, withdrawing services");
                break;
            }
        }
    }

    // free the groups so the goodbyes go on the air before we exit
    let now = Instant::now();
    for group in groups {
        server.entry_group_free(group, now);
    }
    drain(&mut server, &socket, socket_v6.as_ref(), &args, now).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_spec_parses() {
        let spec: PublishSpec = "Files:_smb._tcp:445".parse().unwrap();
        assert_eq!("Files", spec.name);
        assert_eq!("_smb._tcp", spec.service_type);
        assert_eq!(445, spec.port);
        assert!(spec.txt.is_empty());
    }

    #[test]
    fn publish_spec_parses_txt_pairs() {
        let spec: PublishSpec = "Web:_http._tcp:8080:path=/x:flag".parse().unwrap();
        assert_eq!(2, spec.txt.len());
        assert_eq!(Some(&b"/x"[..]), spec.txt.lookup("path"));
        assert_eq!(Some(&b""[..]), spec.txt.lookup("flag"));
    }

    #[test]
    fn publish_spec_rejects_garbage() {
        assert!("".parse::<PublishSpec>().is_err());
        assert!("x".parse::<PublishSpec>().is_err());
        assert!("x:_http._tcp".parse::<PublishSpec>().is_err());
        assert!("x:_http._tcp:notaport".parse::<PublishSpec>().is_err());
    }
}
