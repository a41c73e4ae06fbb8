use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {

    /* session or API endpoint could not be reached */
    #[error("connection error: {0}")]
    Connection(String),

    /* a remote command exited with a non-zero status */
    #[error("command `{command}` failed with status {status}: {output}")]
    Command {
	command: String,
	status: i32,
	output: String,
    },

    /* a manifest document could not be decoded */
    #[error("decode error: {0}")]
    Decode(String),

    /* a decoded object has no REST mapping on the cluster */
    #[error("mapping error: {0}")]
    Mapping(String),

    /* the state store could not be read or written */
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /* a local tool (helm, step, linkerd) failed */
    #[error("{tool} failed: {output}")]
    Tool {
	tool: String,
	output: String,
    },

    /* encapsulate a kube-rust error */
    #[error("kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("`{0}`")]
    Other(String),
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
	Error::Persistence(err.to_string())
    }
}

impl From<ssh2::Error> for Error {
    fn from(err: ssh2::Error) -> Self {
	Error::Connection(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
