use std::sync::Arc;

use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};

use crate::proto::guest_agent_server::GuestAgent;
use crate::proto::{
    ExecEvent, ExecRequest, ExecResponse, ListDirRequest, ListDirResponse, MakeDirRequest,
    PingResponse, PtyCreateRequest, PtyCreateResponse, PtyKillRequest, PtyResizeRequest,
    ReadFileRequest, ReadFileResponse, RemoveRequest, WriteFileRequest, WriteFileResponse,
    WriteFilesRequest, WriteFilesResponse,
};
use crate::pty::PtyManager;
use crate::{exec, files};

pub struct GuestAgentService {
    pty_manager: Arc<PtyManager>,
}

impl GuestAgentService {
    pub fn new(pty_manager: Arc<PtyManager>) -> Self {
        Self { pty_manager }
    }
}

#[tonic::async_trait]
impl GuestAgent for GuestAgentService {
    async fn ping(&self, _request: Request<()>) -> Result<Response<PingResponse>, Status> {
        Ok(Response::new(PingResponse {
            ready: true,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }))
    }

    async fn exec(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<ExecResponse>, Status> {
        let response = exec::exec(request.into_inner()).await?;
        Ok(Response::new(response))
    }

    type ExecStreamStream = ReceiverStream<Result<ExecEvent, Status>>;

    async fn exec_stream(
        &self,
        request: Request<ExecRequest>,
    ) -> Result<Response<Self::ExecStreamStream>, Status> {
        Ok(Response::new(exec::spawn_exec_stream(request.into_inner())))
    }

    async fn read_file(
        &self,
        request: Request<ReadFileRequest>,
    ) -> Result<Response<ReadFileResponse>, Status> {
        Ok(Response::new(files::read_file(request.into_inner()).await?))
    }

    async fn write_file(
        &self,
        request: Request<WriteFileRequest>,
    ) -> Result<Response<WriteFileResponse>, Status> {
        Ok(Response::new(files::write_file(request.into_inner()).await?))
    }

    async fn write_files(
        &self,
        request: Request<WriteFilesRequest>,
    ) -> Result<Response<WriteFilesResponse>, Status> {
        Ok(Response::new(
            files::write_files(request.into_inner()).await?,
        ))
    }

    async fn list_dir(
        &self,
        request: Request<ListDirRequest>,
    ) -> Result<Response<ListDirResponse>, Status> {
        Ok(Response::new(files::list_dir(request.into_inner()).await?))
    }

    async fn make_dir(&self, request: Request<MakeDirRequest>) -> Result<Response<()>, Status> {
        files::make_dir(request.into_inner()).await?;
        Ok(Response::new(()))
    }

    async fn remove(&self, request: Request<RemoveRequest>) -> Result<Response<()>, Status> {
        files::remove(request.into_inner()).await?;
        Ok(Response::new(()))
    }

    async fn pty_create(
        &self,
        request: Request<PtyCreateRequest>,
    ) -> Result<Response<PtyCreateResponse>, Status> {
        let req = request.into_inner();
        let (session_id, data_port) = self
            .pty_manager
            .create(req.cols, req.rows, &req.shell)
            .await?;
        Ok(Response::new(PtyCreateResponse {
            session_id,
            data_port,
        }))
    }

    async fn pty_resize(
        &self,
        request: Request<PtyResizeRequest>,
    ) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.pty_manager
            .resize(&req.session_id, req.cols, req.rows)
            .await?;
        Ok(Response::new(()))
    }

    async fn pty_kill(&self, request: Request<PtyKillRequest>) -> Result<Response<()>, Status> {
        let req = request.into_inner();
        self.pty_manager.kill(&req.session_id).await?;
        Ok(Response::new(()))
    }
}
