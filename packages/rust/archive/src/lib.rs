//! Challenge archive inspection for CTF Forge.
//!
//! Everything here is read-only: walking the archive tree, recognizing
//! challenge directories by their marker files, listing the files a
//! challenge ships, and classifying those files (ELF class, script kind,
//! bundled libc, ...) so the generators can build a container around them.

pub mod analysis;
pub mod files;
pub mod module_yml;
pub mod report;
pub mod scan;

pub use analysis::{
    Architecture, ElfClass, ExecutableKind, GlibcVersion, ProvidedLibraries, PythonServer,
    ShebangIssue, analyze_executable, analyze_python_server, binary_architecture,
    detect_custom_interpreters, detect_elf_class, detect_glibc_version, detect_node_files,
    detect_problematic_shebangs, detect_python_files, elf_interpreter, select_base_image,
};
pub use files::{
    describe_file, files_with_info, filter_out_patched_files, find_check_file, find_sha256_flag,
    list_task_files,
};
pub use module_yml::{category_for_label, category_from_module_yml};
pub use report::file_analysis;
pub use scan::{
    CHALLENGE_JSON, COMPOSE_FILE, DESCRIPTION_FILE, DOCKERFILE, INIT_FILE, REHOST_FILE,
    SHA256_FLAG_FILES, TaskLayout, extract_task_info, find_task_directories, has_compose_enabled,
    has_flagcheck_file, has_sha256_file, is_task_directory, read_description, read_init_content,
    read_rehost_content, walk_directories,
};
