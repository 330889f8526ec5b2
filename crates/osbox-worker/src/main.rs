pub mod agent_client;
pub mod checkpoint;
pub mod config;
pub mod error;
pub mod events;
pub mod firecracker;
pub mod heartbeat;
pub mod hibernate;
pub mod id;
pub mod netpool;
pub mod network;
pub mod provision;
pub mod proxy;
pub mod recovery;
pub mod registry;
pub mod router;
pub mod sandbox;
pub mod supervisor;

pub mod proto {
    tonic::include_proto!("osbox.worker.v1");
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status};
use tracing::{error, info};

use crate::agent_client::agent_proto;
use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::hibernate::HibernationEngine;
use crate::proxy::session::{proxy_env, seal_env, ProxySession, SessionMap};
use crate::router::Router;
use crate::sandbox::{Sandbox, SandboxSpec, SandboxStatus, SandboxTable};
use crate::supervisor::Supervisor;

const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(300);

/// Thin RPC shell over the lifecycle engine. Every sandbox-addressed call
/// goes through the router for activity tracking and auto-wake.
pub struct WorkerService {
    config: Arc<WorkerConfig>,
    sandboxes: Arc<SandboxTable>,
    supervisor: Arc<Supervisor>,
    engine: Arc<HibernationEngine>,
    router: Arc<Router>,
    sessions: Arc<SessionMap>,
    ca: Arc<proxy::ca::CertAuthority>,
}

impl WorkerService {
    async fn create_inner(
        &self,
        sandbox_id: &str,
        req: &proto::CreateSandboxRequest,
    ) -> Result<String, WorkerError> {
        let disks = provision::provision(
            &self.config.images_dir(),
            &self.config.sandbox_dir(sandbox_id),
            &req.template,
            if req.disk_mib == 0 { 1024 } else { req.disk_mib },
        )
        .await?;

        let lease = self
            .supervisor
            .boot(
                sandbox_id,
                if req.vcpu_count == 0 { 1 } else { req.vcpu_count },
                if req.memory_mib == 0 { 512 } else { req.memory_mib },
                &disks.rootfs_path,
                &disks.workspace_path,
            )
            .await?;

        // Seal the secrets, register the proxy session, seed the guest.
        let sealed = seal_env(&req.env);
        let mut guest_env = sealed.guest_env.clone();
        guest_env.extend(proxy_env(&lease.gateway_ip, self.config.proxy_port));

        self.sessions.insert(
            &lease.guest_ip,
            ProxySession {
                sandbox_id: sandbox_id.to_string(),
                substitutions: sealed.substitutions,
                allowed_hosts: req.allowed_hosts.clone(),
            },
        );

        agent_client::seed_guest(
            &self.supervisor.vsock_path(sandbox_id),
            &guest_env,
            self.ca.ca_pem(),
        )
        .await?;

        self.sandboxes
            .update(sandbox_id, |sb| {
                sb.guest_env = guest_env;
                sb.net_slot = Some(lease.slot);
                sb.guest_ip = Some(lease.guest_ip.clone());
            })
            .await?;
        self.sandboxes
            .transition(sandbox_id, SandboxStatus::Running)
            .await?;

        Ok(lease.guest_ip)
    }

    /// Merge the sandbox's guest env (sealed tokens + proxy vars) with the
    /// caller's env; the caller wins on conflict.
    async fn merged_env(
        &self,
        sandbox_id: &str,
        caller_env: &HashMap<String, String>,
    ) -> Result<HashMap<String, String>, WorkerError> {
        let mut env = self
            .sandboxes
            .with(sandbox_id, |sb| sb.guest_env.clone())
            .await?;
        env.extend(caller_env.clone());
        Ok(env)
    }
}

fn to_run_event(event: agent_proto::ExecEvent) -> proto::RunEvent {
    proto::RunEvent {
        seq: event.seq,
        event: event.event.map(|e| match e {
            agent_proto::exec_event::Event::Stdout(data) => {
                proto::run_event::Event::Stdout(data)
            }
            agent_proto::exec_event::Event::Stderr(data) => {
                proto::run_event::Event::Stderr(data)
            }
            agent_proto::exec_event::Event::Exit(exit) => {
                proto::run_event::Event::Exit(proto::RunExit {
                    exit_code: exit.exit_code,
                    duration_ms: exit.duration_ms,
                })
            }
        }),
    }
}

fn system_time_secs(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Project a monotonic instant onto the wall clock for API consumers.
fn instant_to_unix(instant: Instant) -> i64 {
    let now_inst = Instant::now();
    let now_sys = SystemTime::now();
    let projected = if instant >= now_inst {
        now_sys + (instant - now_inst)
    } else {
        now_sys - (now_inst - instant)
    };
    system_time_secs(projected)
}

#[tonic::async_trait]
impl proto::worker_server::Worker for WorkerService {
    async fn create_sandbox(
        &self,
        request: Request<proto::CreateSandboxRequest>,
    ) -> Result<Response<proto::CreateSandboxResponse>, Status> {
        let req = request.into_inner();
        let sandbox_id = if req.sandbox_id.is_empty() {
            id::generate_id(id::SANDBOX_PREFIX)
        } else {
            req.sandbox_id.clone()
        };

        let timeout = if req.timeout_seconds == 0 {
            self.config.default_timeout
        } else {
            Duration::from_secs(req.timeout_seconds as u64)
        };

        let spec = SandboxSpec {
            template: req.template.clone(),
            vcpu_count: req.vcpu_count,
            memory_mib: req.memory_mib,
            disk_mib: req.disk_mib,
            env: req.env.clone(),
            allowed_hosts: req.allowed_hosts.clone(),
            port: req.port,
            timeout,
            hibernation_enabled: req.hibernation_enabled,
        };
        self.sandboxes
            .insert(Sandbox::new(sandbox_id.clone(), spec))
            .await
            .map_err(Status::from)?;

        info!(sandbox_id = %sandbox_id, template = %req.template, "creating sandbox");

        match self.create_inner(&sandbox_id, &req).await {
            Ok(guest_ip) => {
                info!(sandbox_id = %sandbox_id, guest_ip = %guest_ip, "sandbox running");
                Ok(Response::new(proto::CreateSandboxResponse {
                    sandbox_id,
                    guest_ip,
                }))
            }
            Err(e) => {
                error!(sandbox_id = %sandbox_id, error = %e, "sandbox creation failed");
                if let Some(lease) = self.supervisor.lease_of(&sandbox_id).await {
                    self.sessions.remove(&lease.guest_ip);
                    let _ = self.supervisor.kill(&sandbox_id).await;
                }
                let _ = self
                    .sandboxes
                    .update(&sandbox_id, |sb| sb.status = SandboxStatus::Error)
                    .await;
                let _ = provision::cleanup(&self.config.sandbox_dir(&sandbox_id)).await;
                Err(e.into())
            }
        }
    }

    async fn run(
        &self,
        request: Request<proto::RunRequest>,
    ) -> Result<Response<proto::RunResponse>, Status> {
        let req = request.into_inner();
        let env = self.merged_env(&req.sandbox_id, &req.env).await?;

        let agent_req = agent_proto::ExecRequest {
            argv: req.argv.clone(),
            cwd: req.cwd.clone(),
            env,
            timeout_seconds: req.timeout_seconds,
        };

        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let agent_req = agent_req.clone();
                async move { client.exec(agent_req).await.map(|r| r.into_inner()) }
            })
            .await?;

        Ok(Response::new(proto::RunResponse {
            stdout: response.stdout,
            stderr: response.stderr,
            exit_code: response.exit_code,
        }))
    }

    type RunStreamStream = ReceiverStream<Result<proto::RunEvent, Status>>;

    async fn run_stream(
        &self,
        request: Request<proto::RunRequest>,
    ) -> Result<Response<Self::RunStreamStream>, Status> {
        let req = request.into_inner();
        let env = self.merged_env(&req.sandbox_id, &req.env).await?;
        let mut client = self.router.agent(&req.sandbox_id).await?;

        let agent_req = agent_proto::ExecRequest {
            argv: req.argv,
            cwd: req.cwd,
            env,
            timeout_seconds: req.timeout_seconds,
        };
        let response = client
            .exec_stream(agent_req)
            .await
            .map_err(WorkerError::from_agent_status)?;

        let mut agent_stream = response.into_inner();
        let (tx, rx) = tokio::sync::mpsc::channel(32);
        tokio::spawn(async move {
            while let Some(result) = agent_stream.next().await {
                let item = result.map(to_run_event);
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn read_file(
        &self,
        request: Request<proto::ReadFileRequest>,
    ) -> Result<Response<proto::ReadFileResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let path = req.path.clone();
                async move {
                    client
                        .read_file(agent_proto::ReadFileRequest { path })
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
        Ok(Response::new(proto::ReadFileResponse {
            content: response.content,
        }))
    }

    async fn write_file(
        &self,
        request: Request<proto::WriteFileRequest>,
    ) -> Result<Response<proto::WriteFileResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let inner = agent_proto::WriteFileRequest {
                    path: req.path.clone(),
                    content: req.content.clone(),
                };
                async move { client.write_file(inner).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(Response::new(proto::WriteFileResponse {
            bytes_written: response.bytes_written,
        }))
    }

    async fn write_files(
        &self,
        request: Request<proto::WriteFilesRequest>,
    ) -> Result<Response<proto::WriteFilesResponse>, Status> {
        let req = request.into_inner();
        let files: Vec<agent_proto::WriteFileRequest> = req
            .files
            .iter()
            .map(|f| agent_proto::WriteFileRequest {
                path: f.path.clone(),
                content: f.content.clone(),
            })
            .collect();
        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let inner = agent_proto::WriteFilesRequest {
                    files: files.clone(),
                };
                async move { client.write_files(inner).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(Response::new(proto::WriteFilesResponse {
            files_written: response.files_written,
        }))
    }

    async fn list_dir(
        &self,
        request: Request<proto::ListDirRequest>,
    ) -> Result<Response<proto::ListDirResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let path = req.path.clone();
                async move {
                    client
                        .list_dir(agent_proto::ListDirRequest { path })
                        .await
                        .map(|r| r.into_inner())
                }
            })
            .await?;
        Ok(Response::new(proto::ListDirResponse {
            entries: response
                .entries
                .into_iter()
                .map(|e| proto::DirEntry {
                    path: e.path,
                    size: e.size,
                    is_dir: e.is_dir,
                    modified_at: e.modified_at,
                })
                .collect(),
        }))
    }

    async fn make_dir(
        &self,
        request: Request<proto::MakeDirRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.router
            .call(&req.sandbox_id, |mut client| {
                let path = req.path.clone();
                async move { client.make_dir(agent_proto::MakeDirRequest { path }).await }
            })
            .await?;
        Ok(Response::new(()))
    }

    async fn remove(
        &self,
        request: Request<proto::RemoveRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.router
            .call(&req.sandbox_id, |mut client| {
                let path = req.path.clone();
                async move { client.remove(agent_proto::RemoveRequest { path }).await }
            })
            .await?;
        Ok(Response::new(()))
    }

    async fn open_pty(
        &self,
        request: Request<proto::OpenPtyRequest>,
    ) -> Result<Response<proto::OpenPtyResponse>, Status> {
        let req = request.into_inner();
        let response = self
            .router
            .call(&req.sandbox_id, |mut client| {
                let inner = agent_proto::PtyCreateRequest {
                    cols: req.cols,
                    rows: req.rows,
                    shell: req.shell.clone(),
                };
                async move { client.pty_create(inner).await.map(|r| r.into_inner()) }
            })
            .await?;
        Ok(Response::new(proto::OpenPtyResponse {
            session_id: response.session_id,
            data_port: response.data_port,
        }))
    }

    async fn resize_pty(
        &self,
        request: Request<proto::ResizePtyRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.router
            .call(&req.sandbox_id, |mut client| {
                let inner = agent_proto::PtyResizeRequest {
                    session_id: req.session_id.clone(),
                    cols: req.cols,
                    rows: req.rows,
                };
                async move { client.pty_resize(inner).await }
            })
            .await?;
        Ok(Response::new(()))
    }

    async fn kill_pty(
        &self,
        request: Request<proto::KillPtyRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.router
            .call(&req.sandbox_id, |mut client| {
                let inner = agent_proto::PtyKillRequest {
                    session_id: req.session_id.clone(),
                };
                async move { client.pty_kill(inner).await }
            })
            .await?;
        Ok(Response::new(()))
    }

    async fn hibernate(
        &self,
        request: Request<proto::HibernateRequest>,
    ) -> Result<Response<proto::HibernateResponse>, Status> {
        let req = request.into_inner();
        let info = self.engine.hibernate(&req.sandbox_id, req.wait).await?;
        self.router.forget(&req.sandbox_id).await;
        Ok(Response::new(proto::HibernateResponse {
            mem_key: info.mem_key.unwrap_or_default(),
            state_key: info.state_key.unwrap_or_default(),
            workspace_key: info.workspace_key,
            size_bytes: info.size_bytes,
        }))
    }

    async fn wake(
        &self,
        request: Request<proto::WakeRequest>,
    ) -> Result<Response<proto::WakeResponse>, Status> {
        let req = request.into_inner();
        let timeout = if req.timeout_seconds == 0 {
            None
        } else {
            Some(Duration::from_secs(req.timeout_seconds as u64))
        };
        let coords = self.engine.wake(&req.sandbox_id, timeout).await?;
        Ok(Response::new(proto::WakeResponse {
            endpoint: coords.endpoint,
            token: coords.token,
        }))
    }

    async fn kill_sandbox(
        &self,
        request: Request<proto::KillSandboxRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.router.forget(&req.sandbox_id).await;
        self.engine.kill(&req.sandbox_id, "requested").await?;
        Ok(Response::new(()))
    }

    async fn get_sandbox(
        &self,
        request: Request<proto::GetSandboxRequest>,
    ) -> Result<Response<proto::SandboxInfo>, Status> {
        let req = request.into_inner();
        let info = self
            .sandboxes
            .with(&req.sandbox_id, sandbox_info)
            .await?;
        Ok(Response::new(info))
    }

    async fn list_sandboxes(
        &self,
        _request: Request<()>,
    ) -> Result<Response<proto::ListSandboxesResponse>, Status> {
        let mut sandboxes = Vec::new();
        for id in self.sandboxes.ids().await {
            if let Ok(info) = self.sandboxes.with(&id, sandbox_info).await {
                sandboxes.push(info);
            }
        }
        sandboxes.sort_by(|a, b| a.sandbox_id.cmp(&b.sandbox_id));
        Ok(Response::new(proto::ListSandboxesResponse { sandboxes }))
    }
}

fn sandbox_info(sb: &Sandbox) -> proto::SandboxInfo {
    proto::SandboxInfo {
        sandbox_id: sb.id.clone(),
        template: sb.spec.template.clone(),
        status: sb.status.to_string(),
        vcpu_count: sb.spec.vcpu_count,
        memory_mib: sb.spec.memory_mib,
        disk_mib: sb.spec.disk_mib,
        guest_ip: sb.guest_ip.clone().unwrap_or_default(),
        created_at: system_time_secs(sb.created_at),
        last_activity_at: instant_to_unix(sb.last_activity),
        deadline_at: instant_to_unix(sb.deadline),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .ok();

    let config = Arc::new(WorkerConfig::from_env());
    for dir in [
        config.images_dir(),
        config.sandboxes_dir(),
        config.checkpoints_dir(),
        config.ca_dir(),
    ] {
        tokio::fs::create_dir_all(&dir).await?;
    }

    // CA first: 4096-bit RSA generation on first boot takes a moment.
    let ca_dir = std::path::PathBuf::from(config.ca_dir());
    let ca = Arc::new(
        tokio::task::spawn_blocking(move || proxy::ca::CertAuthority::load_or_create(&ca_dir))
            .await??,
    );

    let (event_sender, event_rx) = events::channel(256);
    let registry: Arc<dyn registry::SessionRegistry> = Arc::new(registry::InMemoryRegistry::new());
    tokio::spawn(events::run_reconciler(event_rx, Arc::clone(&registry)));

    let pool = Arc::new(netpool::NetworkPool::new());
    let sandboxes = Arc::new(SandboxTable::new());
    let sessions = Arc::new(SessionMap::new());
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&config),
        Arc::clone(&pool),
        event_sender.clone(),
    ));
    let store = Arc::new(
        checkpoint::CheckpointStore::new(config.s3.clone(), config.checkpoints_dir()).await,
    );
    let engine = Arc::new(HibernationEngine::new(
        Arc::clone(&config),
        Arc::clone(&supervisor),
        Arc::clone(&store),
        Arc::clone(&sandboxes),
        Arc::clone(&sessions),
        Arc::clone(&pool),
        Arc::clone(&ca),
        event_sender.clone(),
    ));
    let router = Arc::new(Router::new(
        Arc::clone(&config),
        Arc::clone(&sandboxes),
        Arc::clone(&supervisor),
        Arc::clone(&engine),
        Arc::clone(&registry),
    ));

    // Reconcile whatever the previous incarnation left behind.
    recovery::run(&config, &sandboxes, &registry).await?;
    recovery::settle().await;

    // Secrets proxy, shared by all sandboxes on this worker.
    let proxy_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", config.proxy_port)).await?;
    let secrets_proxy = Arc::new(proxy::SecretsProxy::new(
        Arc::clone(&ca),
        Arc::clone(&sessions),
        vec![],
    ));
    tokio::spawn(secrets_proxy.serve(proxy_listener));

    tokio::spawn(Arc::clone(&router).run_scanner());
    tokio::spawn(Arc::clone(&engine).run_autosaver(AUTOSAVE_INTERVAL));
    tokio::spawn(heartbeat::run(
        Arc::clone(&config),
        Arc::clone(&sandboxes),
        Arc::clone(&pool),
        event_sender,
    ));

    let service = WorkerService {
        config: Arc::clone(&config),
        sandboxes,
        supervisor,
        engine,
        router,
        sessions,
        ca,
    };

    let addr = format!("0.0.0.0:{}", config.grpc_port).parse()?;
    info!(
        worker_id = %config.worker_id,
        grpc_port = config.grpc_port,
        proxy_port = config.proxy_port,
        data_dir = %config.data_dir,
        "osbox worker ready"
    );

    tonic::transport::Server::builder()
        .add_service(proto::worker_server::WorkerServer::new(service))
        .serve(addr)
        .await?;

    store.wait_uploads(Duration::from_secs(60)).await;
    Ok(())
}
