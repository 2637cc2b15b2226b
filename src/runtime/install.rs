//! Runtime installation fallback
//!
//! Workflow:
//! 1. `uname -a` to guess the OS family and CPU
//! 2. Wipe and recreate `<wd>/jdk`
//! 3. Stream the matching bundle from a [`BundleSource`] to `<wd>/<bundle>`
//! 4. `tar -xzf` it into `<wd>/jdk`
//!
//! The caller re-probes `<wd>/jdk/bin/java` afterwards.

use std::fmt;
use std::io;
use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use regex::Regex;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use super::locator::installed_java_path;
use crate::launcher::Progress;
use crate::sftp::{remote_join, SftpError};
use crate::ssh::{sh_quote, BoxedReader, Transport, TransportError};

/// Matches `i386`..`i686` and `386`..`686` as a whole word.
static IX86: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"\bi?[3-6]86\b").expect("valid regex")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Linux,
    Solaris,
    Windows,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::Linux => "linux",
            Platform::Solaris => "solaris",
            Platform::Windows => "windows",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cpu {
    I386,
    Amd64,
    Sparc,
    Arm64,
}

impl Cpu {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cpu::I386 => "i586",
            Cpu::Amd64 => "x64",
            Cpu::Sparc => "sparc",
            Cpu::Arm64 => "aarch64",
        }
    }
}

impl fmt::Display for Cpu {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Guess the platform from `uname -a` output.
///
/// Later matches override earlier ones, so `SunOS ... i86pc i386` is
/// Solaris/i386 and `... x86_64 GNU/Linux` is Linux/amd64.
pub fn detect_environment(uname: &str) -> Option<(Platform, Cpu)> {
    let mut platform = None;
    if uname.contains("GNU/Linux") {
        platform = Some(Platform::Linux);
    }
    if uname.contains("SunOS") {
        platform = Some(Platform::Solaris);
    }
    if uname.contains("CYGWIN") || uname.contains("Windows_NT") {
        platform = Some(Platform::Windows);
    }

    let mut cpu = None;
    if uname.contains("sparc") {
        cpu = Some(Cpu::Sparc);
    }
    if uname.contains("aarch64") || uname.contains("arm64") {
        cpu = Some(Cpu::Arm64);
    }
    if uname.contains("x86_64") {
        cpu = Some(Cpu::Amd64);
    }
    if IX86.is_match(uname) {
        cpu = Some(Cpu::I386);
    }

    Some((platform?, cpu?))
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Failed to detect the environment for automatic JDK installation from {0:?}")]
    UnknownEnvironment(String),

    #[error("Failed to run 'uname' to obtain the environment")]
    Uname,

    #[error("No JDK bundle source is configured")]
    NoSource,

    #[error("Failed to download the JDK bundle: {0}")]
    Download(String),

    #[error("Failed to upload the JDK bundle: {0}")]
    Upload(#[source] io::Error),

    #[error("Failed to extract the JDK bundle (exit status {status:?}): {output}")]
    Extract { status: Option<u32>, output: String },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Sftp(#[from] SftpError),
}

/// Where runtime bundles come from.
#[async_trait]
pub trait BundleSource: Send + Sync {
    /// Name the bundle gets in the working directory.
    fn file_name(&self, platform: Platform, cpu: Cpu) -> String {
        format!("jdk-{}-{}.tar.gz", platform, cpu)
    }

    async fn open(&self, platform: Platform, cpu: Cpu) -> Result<BoxedReader, InstallError>;
}

/// Downloads bundles over HTTP(S).
///
/// `{platform}` and `{cpu}` in the URL template are substituted.
#[derive(Debug, Clone)]
pub struct HttpBundleSource {
    client: reqwest::Client,
    url_template: String,
}

impl HttpBundleSource {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url_template: url_template.into(),
        }
    }

    pub fn url(&self, platform: Platform, cpu: Cpu) -> String {
        self.url_template
            .replace("{platform}", platform.as_str())
            .replace("{cpu}", cpu.as_str())
    }
}

#[async_trait]
impl BundleSource for HttpBundleSource {
    async fn open(&self, platform: Platform, cpu: Cpu) -> Result<BoxedReader, InstallError> {
        let url = self.url(platform, cpu);
        info!("[runtime] Downloading {}", url);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| InstallError::Download(e.to_string()))?;

        let stream = response.bytes_stream().map_err(io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}

/// Installs a runtime on the remote host.
#[async_trait]
pub trait RuntimeInstaller: Send + Sync {
    /// Returns the path of the installed Java executable.
    async fn install(
        &self,
        transport: &mut dyn Transport,
        working_directory: &str,
        progress: &Progress,
    ) -> Result<String, InstallError>;
}

/// Unpacks a `.tar.gz` bundle under the working directory.
#[derive(Clone)]
pub struct BundleInstaller {
    source: Option<Arc<dyn BundleSource>>,
}

impl BundleInstaller {
    pub fn new(source: Arc<dyn BundleSource>) -> Self {
        Self {
            source: Some(source),
        }
    }

    /// An installer that always fails with [`InstallError::NoSource`].
    pub fn disabled() -> Self {
        Self { source: None }
    }
}

#[async_trait]
impl RuntimeInstaller for BundleInstaller {
    async fn install(
        &self,
        transport: &mut dyn Transport,
        working_directory: &str,
        progress: &Progress,
    ) -> Result<String, InstallError> {
        let uname = transport.exec("uname -a").await?;
        progress.output(&uname.combined());
        if !uname.success() {
            return Err(InstallError::Uname);
        }
        let uname = uname.combined();
        let (platform, cpu) = detect_environment(&uname)
            .ok_or_else(|| InstallError::UnknownEnvironment(uname.trim().to_string()))?;
        debug!("[runtime] Detected {}/{}", platform, cpu);

        let source = self.source.as_ref().ok_or(InstallError::NoSource)?;

        let java_dir = remote_join(working_directory, "jdk");
        let bundle_path = remote_join(working_directory, &source.file_name(platform, cpu));

        transport.exec(&format!("rm -rf {}", sh_quote(&java_dir))).await?;
        let mut fs = transport.open_sftp().await?;
        fs.mkdirs(&java_dir, 0o755).await?;

        progress.info(format!("Downloading JDK for {}/{}", platform, cpu));
        let mut bundle = source.open(platform, cpu).await?;
        let mut remote = fs.create(&bundle_path).await?;
        let copied = tokio::io::copy(&mut bundle, &mut remote)
            .await
            .map_err(InstallError::Upload)?;
        tokio::io::AsyncWriteExt::shutdown(&mut remote)
            .await
            .map_err(InstallError::Upload)?;
        fs.chmod(&bundle_path, 0o755).await?;
        fs.close().await;
        debug!("[runtime] Uploaded {} bytes to {}", copied, bundle_path);

        progress.info(format!("Installing JDK to {}", java_dir));
        let extract = transport
            .exec(&format!(
                "tar -xzf {} -C {} --strip-components=1",
                sh_quote(&bundle_path),
                sh_quote(&java_dir)
            ))
            .await?;
        if !extract.success() {
            return Err(InstallError::Extract {
                status: extract.exit_status,
                output: extract.combined(),
            });
        }

        Ok(installed_java_path(working_directory))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::MemoryListener;
    use crate::ssh::mock::{default_response, MockCall, MockRemote};
    use crate::ssh::{Connector, ExecOutput, RemoteTarget};

    struct StaticBundle(&'static [u8]);

    #[async_trait]
    impl BundleSource for StaticBundle {
        async fn open(&self, _platform: Platform, _cpu: Cpu) -> Result<BoxedReader, InstallError> {
            Ok(Box::new(self.0))
        }
    }

    #[test]
    fn test_detects_known_uname_samples() {
        let samples = [
            ("Linux bear 2.6.28-15-generic #49-Ubuntu SMP Tue Aug 18 19:25:34 UTC 2009 x86_64 GNU/Linux", Platform::Linux, Cpu::Amd64),
            ("Linux wssqe20 2.6.24-24-386 #1 Tue Aug 18 16:24:26 UTC 2009 i686 GNU/Linux", Platform::Linux, Cpu::I386),
            ("SunOS hudson 5.11 snv_79a i86pc i386 i86pc", Platform::Solaris, Cpu::I386),
            ("SunOS legolas 5.9 Generic_112233-12 sun4u sparc SUNW,Sun-Fire-280R", Platform::Solaris, Cpu::Sparc),
            ("CYGWIN_NT-5.1 franz 1.7.0(0.185/5/3) 2008-07-22 19:09 i686 Cygwin", Platform::Windows, Cpu::I386),
            ("Windows_NT WINXPIE7 5 01 586", Platform::Windows, Cpu::I386),
            ("Linux pi 6.1.0-rpi7-rpi-v8 #1 SMP PREEMPT aarch64 GNU/Linux", Platform::Linux, Cpu::Arm64),
        ];
        for (uname, platform, cpu) in samples {
            assert_eq!(detect_environment(uname), Some((platform, cpu)), "{}", uname);
        }
    }

    #[test]
    fn test_unknown_environment() {
        assert_eq!(detect_environment("Darwin mac 23.1.0 arm64"), None);
        assert_eq!(detect_environment("FreeBSD box 13.2-RELEASE amd64"), None);
        assert_eq!(detect_environment(""), None);
    }

    #[test]
    fn test_url_template() {
        let source = HttpBundleSource::new("https://mirror.example/jdk/{platform}/{cpu}.tar.gz");
        assert_eq!(
            source.url(Platform::Linux, Cpu::Amd64),
            "https://mirror.example/jdk/linux/x64.tar.gz"
        );
    }

    #[tokio::test]
    async fn test_install_unpacks_bundle() {
        let remote = MockRemote::builder().dir("/srv").dir("/srv/agent").build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let installer = BundleInstaller::new(Arc::new(StaticBundle(b"bundle-bytes")));
        let progress = Progress::new(MemoryListener::new());

        let java = installer
            .install(transport.as_mut(), "/srv/agent", &progress)
            .await
            .unwrap();

        assert_eq!(java, "/srv/agent/jdk/bin/java");
        let bundle = remote.file("/srv/agent/jdk-linux-x64.tar.gz").unwrap();
        assert_eq!(bundle.data, b"bundle-bytes");
        assert_eq!(bundle.mode, 0o755);
        assert_eq!(remote.dir_mode("/srv/agent/jdk"), Some(0o755));
        assert_eq!(
            remote.execs(),
            vec![
                "uname -a",
                "rm -rf '/srv/agent/jdk'",
                "tar -xzf '/srv/agent/jdk-linux-x64.tar.gz' -C '/srv/agent/jdk' --strip-components=1",
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_environment_stops_before_changes() {
        let remote = MockRemote::builder()
            .responder(|cmd| match cmd {
                "uname -a" => Ok(ExecOutput::ok("Darwin mac 23.1.0 arm64\n")),
                other => default_response(other),
            })
            .build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let installer = BundleInstaller::new(Arc::new(StaticBundle(b"")));
        let progress = Progress::new(MemoryListener::new());

        let err = installer
            .install(transport.as_mut(), "/srv/agent", &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::UnknownEnvironment(_)));
        assert!(!remote.calls().contains(&MockCall::OpenSftp));
    }

    #[tokio::test]
    async fn test_disabled_installer() {
        let remote = MockRemote::builder().build();
        let mut transport = remote.connect(&RemoteTarget::new("h", 22)).await.unwrap();
        let progress = Progress::new(MemoryListener::new());

        let err = BundleInstaller::disabled()
            .install(transport.as_mut(), "/srv/agent", &progress)
            .await
            .unwrap_err();
        assert!(matches!(err, InstallError::NoSource));
    }
}
