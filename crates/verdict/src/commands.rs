//! Command implementations: build the call, send it, print the result.

use anyhow::{bail, Result};
use std::time::Duration;
use verdict_protocol::{
    ConnectionSpec, EchoParams, ProductPatch, RpcResponse, ServiceCall, TaskFilter, TaskParams,
    TaskStatus, TaskToken,
};

use crate::client::RpcClient;
use crate::session;
use crate::{PlanCommand, ProductCommand, TaskCommand};

fn connect(server: &str) -> Result<RpcClient> {
    RpcClient::connect(server, session::load())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Print the interesting payload of a response.
fn print_response(response: &RpcResponse) -> Result<()> {
    match response {
        RpcResponse::Ok => println!("ok"),
        RpcResponse::Pong => println!("pong"),
        RpcResponse::Bool(value) => println!("{value}"),
        RpcResponse::Token(token) => println!("{token}"),
        RpcResponse::DataDir(path) => println!("{path}"),
        RpcResponse::SessionId(_) => println!("ok"),
        RpcResponse::TerminalStatus(status) => println!("{status}"),
        other => print_json(other)?,
    }
    Ok(())
}

pub fn ping(server: &str) -> Result<()> {
    let response = connect(server)?.request("/server", ServiceCall::Ping)?;
    print_response(&response)
}

pub fn login(server: &str, username: &str, password: &str) -> Result<()> {
    let client = RpcClient::connect(server, None)?;
    let response = client.request(
        "/auth",
        ServiceCall::Login {
            username: username.to_string(),
            password: password.to_string(),
        },
    )?;
    match response {
        RpcResponse::SessionId(session_id) => {
            session::save(&session_id)?;
            println!("logged in as {username}");
            Ok(())
        }
        other => bail!("unexpected response to login: {other:?}"),
    }
}

pub fn logout(server: &str) -> Result<()> {
    let response = connect(server)?.request("/auth", ServiceCall::Logout);
    session::clear();
    match response {
        Ok(_) => println!("logged out"),
        Err(_) => println!("local session cleared"),
    }
    Ok(())
}

pub fn whoami(server: &str) -> Result<()> {
    let response = connect(server)?.request("/auth", ServiceCall::Whoami)?;
    print_response(&response)
}

pub fn server_info(server: &str) -> Result<()> {
    let response = connect(server)?.request("/server", ServiceCall::ServerInfo)?;
    print_response(&response)
}

pub fn products(server: &str, command: ProductCommand) -> Result<()> {
    let client = connect(server)?;
    let response = match command {
        ProductCommand::List => client.request("/products", ServiceCall::ListProducts)?,
        ProductCommand::Add {
            endpoint,
            name,
            description,
            sqlite,
            pg_host,
            pg_port,
            pg_user,
            pg_password,
            pg_database,
        } => {
            let connection = match (sqlite, pg_host) {
                (Some(path), None) => ConnectionSpec::Sqlite {
                    path: path.display().to_string(),
                },
                (None, Some(host)) => {
                    let (Some(user), Some(password), Some(database)) =
                        (pg_user, pg_password, pg_database)
                    else {
                        bail!("--pg-host requires --pg-user, --pg-password, and --pg-database");
                    };
                    ConnectionSpec::Postgres {
                        host,
                        port: pg_port,
                        user,
                        password,
                        database,
                    }
                }
                _ => bail!("pass exactly one of --sqlite or --pg-host ..."),
            };
            client.request(
                "/products",
                ServiceCall::AddProduct {
                    endpoint,
                    display_name: name,
                    description,
                    connection,
                },
            )?
        }
        ProductCommand::Remove { endpoint } => {
            client.request("/products", ServiceCall::RemoveProduct { endpoint })?
        }
        ProductCommand::Edit {
            endpoint,
            name,
            description,
        } => client.request(
            "/products",
            ServiceCall::EditProduct {
                endpoint,
                patch: ProductPatch {
                    display_name: name,
                    description,
                    connection: None,
                },
            },
        )?,
        ProductCommand::Status { endpoint } => {
            client.request("/products", ServiceCall::GetProductStatus { endpoint })?
        }
    };
    print_response(&response)
}

pub fn tasks(server: &str, command: TaskCommand) -> Result<()> {
    match command {
        TaskCommand::List {
            status,
            kind,
            product,
            actor,
            limit,
        } => {
            let statuses = if status.is_empty() {
                None
            } else {
                let parsed: Result<Vec<TaskStatus>, _> =
                    status.iter().map(|s| s.parse()).collect();
                Some(parsed.map_err(anyhow::Error::msg)?)
            };
            let filter = TaskFilter {
                statuses,
                kinds: kind.map(|k| vec![k]),
                product,
                actor,
                limit,
                ..Default::default()
            };
            let response = connect(server)?.request("/tasks", ServiceCall::GetTasks { filter })?;
            print_response(&response)
        }
        TaskCommand::Show { token } => {
            let token = parse_token(&token)?;
            let response = connect(server)?.request("/tasks", ServiceCall::GetTaskInfo { token })?;
            print_response(&response)
        }
        TaskCommand::Cancel { token } => {
            let token = parse_token(&token)?;
            let response = connect(server)?.request("/tasks", ServiceCall::CancelTask { token })?;
            print_response(&response)
        }
        TaskCommand::Await {
            token,
            consume,
            timeout_secs,
        } => {
            let token = parse_token(&token)?;
            let client = RpcClient::connect_with_timeout(
                server,
                session::load(),
                Duration::from_secs(timeout_secs),
            )?;
            let response =
                client.request("/tasks", ServiceCall::AwaitTaskTermination { token, consume })?;
            print_response(&response)
        }
        TaskCommand::Comment { token, body } => {
            let token = parse_token(&token)?;
            let response =
                connect(server)?.request("/tasks", ServiceCall::AddTaskComment { token, body })?;
            print_response(&response)
        }
        TaskCommand::Echo {
            delay_ms,
            fail_with,
        } => {
            let params = TaskParams::Echo(EchoParams {
                delay_ms,
                check_interval_ms: 10,
                fail_with,
            });
            let client = connect(server)?;
            let response = client.request(
                "/tasks",
                ServiceCall::AllocateTask {
                    summary: format!("echo {delay_ms}ms"),
                    params: params.clone(),
                },
            )?;
            let RpcResponse::Token(token) = response else {
                bail!("unexpected response to allocate: {response:?}");
            };
            client.request("/tasks", ServiceCall::PushTask { token, params })?;
            eprintln!("task {token} enqueued, waiting...");

            let waiter = RpcClient::connect_with_timeout(
                server,
                session::load(),
                Duration::from_secs(600),
            )?;
            let response = waiter.request(
                "/tasks",
                ServiceCall::AwaitTaskTermination {
                    token,
                    consume: true,
                },
            )?;
            print_response(&response)
        }
    }
}

pub fn plans(server: &str, product: &str, command: PlanCommand) -> Result<()> {
    let path = format!("/{product}/cleanup_plans");
    let client = connect(server)?;
    let response = match command {
        PlanCommand::List { all } => client.request(
            &path,
            ServiceCall::ListCleanupPlans {
                include_closed: all,
            },
        )?,
        PlanCommand::Create {
            name,
            description,
            due_date,
        } => client.request(
            &path,
            ServiceCall::CreateCleanupPlan {
                name,
                description,
                due_date,
            },
        )?,
        PlanCommand::Close { id } => client.request(&path, ServiceCall::CloseCleanupPlan { id })?,
        PlanCommand::Reopen { id } => {
            client.request(&path, ServiceCall::ReopenCleanupPlan { id })?
        }
        PlanCommand::Delete { id } => {
            client.request(&path, ServiceCall::DeleteCleanupPlan { id })?
        }
        PlanCommand::Set { id, hashes } => client.request(
            &path,
            ServiceCall::SetPlan {
                id,
                report_hashes: hashes,
            },
        )?,
        PlanCommand::Unset { id, hashes } => client.request(
            &path,
            ServiceCall::UnsetPlan {
                id,
                report_hashes: hashes,
            },
        )?,
    };
    print_response(&response)
}

fn parse_token(text: &str) -> Result<TaskToken> {
    text.parse()
        .map_err(|e| anyhow::anyhow!("invalid task token '{text}': {e}"))
}
