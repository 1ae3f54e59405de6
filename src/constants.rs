//! Shared constants / 共享常量

/// Component names as exposed by the HTTP API / HTTP接口暴露的组件名称
pub mod component {
    pub const CPU: &str = "cpu";
    pub const NVGPU: &str = "nvgpu";
    pub const BMC: &str = "bmc";
}

/// Backend variants selectable through configuration / 可配置的后端类型
pub mod backend {
    pub const NVML: &str = "nvml";
    pub const INSPUR_NF5280M6: &str = "Inspur-NF5280M6";
}

/// Control command tokens / 控制命令标记
pub mod command {
    pub const SELECT_ALL: &str = "all";
    pub const CHANGE_GOV: &str = "change-gov";
    pub const CHANGE_FREQ: &str = "change-freq";
    pub const CHANGE_PL: &str = "change-pl";
    pub const SET_AUTO: &str = "set-auto";
    pub const CHANGE_SPEED: &str = "change-speed";
}

/// Attribute names accepted by `/api/get` / `/api/get` 接受的属性名
pub mod attr {
    pub const CPUFREQS: &str = "cpufreqs";
    pub const PLC: &str = "plc";
    pub const CAUTO: &str = "cauto";
    pub const FANNUMS: &str = "fannums";
}

/// Governor required for pinning a frequency / 固定频率所需的调速器
pub const USERSPACE_GOVERNOR: &str = "userspace";

/// Substitute value for readings the backend reports as missing
/// 后端缺失读数时使用的替代值
pub const MISSING_READING: f64 = -1.0;
