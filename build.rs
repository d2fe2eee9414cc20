//! Build script for mpiparams.
//!
//! Without the `mpi` feature there is nothing to build: the local transport
//! is pure Rust. With it, the script locates an MPI installation, compiles
//! the C shim in `csrc/` against its headers and links the library.
//!
//! Discovery order:
//! 1. `MPI_PKG_CONFIG`, a pkg-config package name
//! 2. the pkg-config packages `mpich`, `ompi` and `mpi`
//! 3. the compiler wrapper (`$MPICC` or `mpicc`), via `-show` or `--showme`
//! 4. `MPI_HOME` or `CRAY_MPICH_DIR`, taken as an installation prefix
//! 5. a few conventional prefixes

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHIM_SOURCE: &str = "csrc/mpiparams.c";
const SHIM_HEADER: &str = "csrc/mpiparams.h";

fn main() {
    println!("cargo:rerun-if-changed={SHIM_SOURCE}");
    println!("cargo:rerun-if-changed={SHIM_HEADER}");
    for var in ["MPI_PKG_CONFIG", "MPICC", "MPI_HOME", "CRAY_MPICH_DIR"] {
        println!("cargo:rerun-if-env-changed={var}");
    }

    if env::var_os("CARGO_FEATURE_MPI").is_none() {
        return;
    }

    let Some((install, found_by)) = discover() else {
        panic!(
            "the `mpi` feature needs an MPI installation (MPICH or Open MPI). Either:\n\
             - set MPI_PKG_CONFIG to its pkg-config package (e.g. 'mpich')\n\
             - put 'mpicc' on PATH, or point MPICC at the compiler wrapper\n\
             - set MPI_HOME (or CRAY_MPICH_DIR on Cray systems) to the installation prefix"
        );
    };
    eprintln!("mpiparams: MPI found via {found_by}");

    compile_shim(&install);
    install.emit_link_flags();
}

/// What the shim needs to compile and link against one MPI installation.
#[derive(Debug, Default)]
struct MpiInstall {
    include_dirs: Vec<PathBuf>,
    lib_dirs: Vec<PathBuf>,
    libs: Vec<String>,
    version: Option<String>,
}

impl MpiInstall {
    /// An installation laid out as `<prefix>/include` and `<prefix>/lib*`,
    /// if the prefix holds `mpi.h`.
    fn from_prefix(prefix: &Path) -> Option<Self> {
        let include = prefix.join("include");
        if !include.join("mpi.h").is_file() {
            return None;
        }
        let lib_dirs = ["lib64", "lib"]
            .iter()
            .map(|dir| prefix.join(dir))
            .filter(|dir| dir.is_dir())
            .collect();
        Some(MpiInstall {
            include_dirs: vec![include],
            lib_dirs,
            libs: vec!["mpi".to_string()],
            version: None,
        })
    }

    /// Read the flags a compiler wrapper would pass.
    fn from_wrapper_flags(flags: &str) -> Self {
        let mut install = MpiInstall::default();
        for flag in flags.split_whitespace() {
            if let Some(dir) = flag.strip_prefix("-I") {
                install.include_dirs.push(PathBuf::from(dir));
            } else if let Some(dir) = flag.strip_prefix("-L") {
                install.lib_dirs.push(PathBuf::from(dir));
            } else if let Some(lib) = flag.strip_prefix("-l") {
                install.libs.push(lib.to_string());
            }
        }
        if install.libs.is_empty() {
            install.libs.push("mpi".to_string());
        }
        install
    }

    fn emit_link_flags(&self) {
        for dir in &self.lib_dirs {
            println!("cargo:rustc-link-search=native={}", dir.display());
            // Binaries launched by mpiexec must find this same libmpi
            println!("cargo:rustc-link-arg=-Wl,-rpath,{}", dir.display());
        }
        for lib in &self.libs {
            println!("cargo:rustc-link-lib={lib}");
        }
        if let Some(version) = &self.version {
            println!("cargo:rustc-env=MPI_VERSION={version}");
        }
    }
}

fn discover() -> Option<(MpiInstall, String)> {
    if let Ok(package) = env::var("MPI_PKG_CONFIG") {
        if let Some(install) = from_pkg_config(&package) {
            return Some((install, format!("MPI_PKG_CONFIG={package}")));
        }
    }

    for package in ["mpich", "ompi", "mpi"] {
        if let Some(install) = from_pkg_config(package) {
            return Some((install, format!("pkg-config package '{package}'")));
        }
    }

    let wrapper = env::var("MPICC").unwrap_or_else(|_| "mpicc".to_string());
    // MPICH spells it -show, Open MPI --showme
    for arg in ["-show", "--showme"] {
        if let Some(flags) = run_wrapper(&wrapper, arg) {
            return Some((MpiInstall::from_wrapper_flags(&flags), format!("{wrapper} {arg}")));
        }
    }

    for var in ["MPI_HOME", "CRAY_MPICH_DIR"] {
        if let Some(prefix) = env::var_os(var) {
            if let Some(install) = MpiInstall::from_prefix(Path::new(&prefix)) {
                return Some((install, format!("{var}={}", Path::new(&prefix).display())));
            }
        }
    }

    ["/usr", "/usr/local", "/opt/mpich", "/opt/openmpi"]
        .iter()
        .find_map(|prefix| {
            MpiInstall::from_prefix(Path::new(prefix)).map(|install| (install, format!("prefix {prefix}")))
        })
}

fn from_pkg_config(package: &str) -> Option<MpiInstall> {
    // Link flags are emitted by emit_link_flags, with an rpath
    let library = pkg_config::Config::new()
        .cargo_metadata(false)
        .probe(package)
        .ok()?;
    Some(MpiInstall {
        include_dirs: library.include_paths,
        lib_dirs: library.link_paths,
        libs: library.libs,
        version: Some(library.version),
    })
}

fn run_wrapper(wrapper: &str, arg: &str) -> Option<String> {
    let output = Command::new(wrapper).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let flags = String::from_utf8_lossy(&output.stdout).into_owned();
    (!flags.trim().is_empty()).then_some(flags)
}

fn compile_shim(install: &MpiInstall) {
    let mut build = cc::Build::new();
    build
        .file(SHIM_SOURCE)
        .include("csrc")
        .includes(&install.include_dirs)
        .warnings(true)
        .extra_warnings(true);
    if env::var("PROFILE").as_deref() == Ok("release") {
        build.opt_level(3);
    }
    build.compile("mpiparams");
}
