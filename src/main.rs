use std::error::Error;
use std::io::{self, BufRead};
use std::net::SocketAddr;
use structopt::StructOpt;

use roster::client::{Command, Session, SessionError, HELP_TEXT};
use roster::server::Server;

#[derive(StructOpt, Debug)]
#[structopt(name = "roster")]
enum Opt {
    Client(ClientOpt),
    Server(ServerOpt),
}

#[derive(StructOpt, Debug)]
struct ClientOpt {
    #[structopt(long = "username")]
    username: String,

    #[structopt(long = "server-addr", default_value = "127.0.0.1:9000")]
    server_addr: String,
}

#[derive(StructOpt, Debug)]
struct ServerOpt {
    #[structopt(long = "listen-addr", default_value = "0.0.0.0:9000")]
    listen_addr: SocketAddr,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let opt: Opt = StructOpt::from_args();

    match opt {
        Opt::Server(opt) => run_server(opt),
        Opt::Client(opt) => run_client(opt),
    }
}

fn run_server(opt: ServerOpt) -> Result<(), Box<dyn Error>> {
    let rt = tokio::runtime::Runtime::new()?;

    rt.block_on(async {
        let server = Server::new(opt.listen_addr).await?;
        log::info!("listening on {}", server.local_addr()?);
        server.run().await
    })?;

    Ok(())
}

fn run_client(opt: ClientOpt) -> Result<(), Box<dyn Error>> {
    let mut session = Session::connect(opt.server_addr.as_str(), &opt.username)?;

    println!("Logged in as {}.", session.username());
    println!("{}", HELP_TEXT);

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }

        match Command::parse(&line) {
            Ok(Command::Users) => {
                if let Err(e) = session.request_users() {
                    log::warn!("user list query failed: {}", e);
                }
            }
            Ok(Command::Msg { to, body }) => match session.send_chat(&to, &body) {
                Ok(()) => println!("To {}: {}", to, body),
                Err(SessionError::UnknownPeer(name)) => {
                    println!("User '{}' is not online or doesn't exist.", name);
                    println!("Use /users to see the list of online users.");
                }
                Err(e) => log::warn!("send failed: {}", e),
            },
            Ok(Command::Quit) => break,
            Ok(Command::Help) => println!("{}", HELP_TEXT),
            Err(guidance) => println!("{}", guidance),
        }
    }

    println!("Logging out...");
    session.logout();

    Ok(())
}
