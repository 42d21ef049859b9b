pub mod local_shell;
pub mod mock;
pub mod native_ssh;
pub mod ssh_command;

pub use local_shell::LocalShellExecutor;
pub use mock::{MockBehavior, MockExecutor};
pub use native_ssh::{NativeSshExecutor, SshAuth};
pub use ssh_command::SshCommandExecutor;
